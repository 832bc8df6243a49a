//! Session data and lifecycle notifications.

use serde::{Deserialize, Serialize};
use toon_api::Token;
use url::Url;

/// One authenticated credential set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub config_id: String,
    pub token: Token,
    pub title: String,
}

impl Session {
    /// Identity handed to devices when they are rebound.
    pub fn binding(&self) -> SessionBinding {
        SessionBinding {
            session_id: self.session_id.clone(),
            config_id: self.config_id.clone(),
            title: self.title.clone(),
        }
    }
}

/// Session identity without the secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub session_id: String,
    pub config_id: String,
    pub title: String,
}

/// Handshake state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

/// Broadcast to observers of the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The user must open this URL to grant access.
    AuthorizationUrl(Url),
    /// A session was established and persisted.
    Authorized { session_id: String, title: String },
    /// A login attempt failed.
    Error(String),
    /// A device could not be moved onto the new session.
    RebindFailed { device_id: String, message: String },
    /// The session was removed.
    LoggedOut { session_id: String },
}
