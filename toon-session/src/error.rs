use thiserror::Error;
use toon_api::ApiError;

use crate::manager::RebindFailure;

/// Errors from the session store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store contents are invalid: {0}")]
    Corrupt(String),
}

/// Errors that can occur while managing the session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Token exchange, refresh or session lookup failed
    #[error("Authorization failed: {0}")]
    Auth(#[from] ApiError),

    /// The user or provider refused the authorization request
    #[error("Authorization denied: {0}")]
    Denied(String),

    /// More than one session is persisted
    #[error("Session store holds {count} sessions, expected at most one")]
    SessionIntegrity { count: usize },

    /// No session is persisted or active
    #[error("Not authenticated")]
    NotAuthenticated,

    /// A second login was started while one is waiting for its code
    #[error("A login is already in progress")]
    LoginInProgress,

    /// Nothing can deliver an authorization code anymore
    #[error("Authorization callback channel closed")]
    CallbackClosed,

    /// One or more devices could not be moved onto the new session
    #[error("{} device(s) failed to rebind: {}", .0.len(), summarize(.0))]
    DeviceRebind(Vec<RebindFailure>),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn summarize(failures: &[RebindFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.device_id, f.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
