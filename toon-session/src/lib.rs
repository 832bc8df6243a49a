//! # toon-session
//!
//! Owns the single OAuth2 credential of an installation and the API client
//! built on top of it.
//!
//! ## Lifecycle
//!
//! ```text
//! Unauthenticated ──login()──▶ Authenticating ──code exchanged──▶ Authenticated
//!        ▲                          │                                  │
//!        └────────── failure ───────┘◀──────────── logout() ───────────┘
//! ```
//!
//! - [`SessionManager::login`] drives the authorization-code handshake. The
//!   authorization URL is published as [`SessionEvent::AuthorizationUrl`] and
//!   the code arrives on the channel returned by
//!   [`SessionManager::authorization_sender`].
//! - After a successful login every registered [`ManagedDevice`] is rebound
//!   to the new client. Failures are collected, never short-circuited.
//! - [`SessionManager::logout`] removes the stored session and marks every
//!   managed device unavailable.
//!
//! The persisted state lives in a [`SessionStore`]. Finding more than one
//! stored session is treated as corruption and reported as
//! [`SessionError::SessionIntegrity`]; the manager never picks one.

pub mod error;
pub mod manager;
pub mod session;
pub mod store;
pub mod tokens;

pub use error::{Result, SessionError, StoreError};
pub use manager::{
    AuthorizationCallback, BoxError, LoginOutcome, ManagedDevice, RebindFailure, SessionManager,
};
pub use session::{Session, SessionBinding, SessionEvent, SessionState};
pub use store::{JsonFileStore, MemorySessionStore, SessionStore};
pub use tokens::SessionTokenSource;
