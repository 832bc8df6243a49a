//! # toon-api
//!
//! Typed async client for the Toon thermostat cloud API.
//!
//! The crate is split along the two provider surfaces:
//!
//! - [`oauth`]: the OAuth2 authorization-code handshake (authorization URL,
//!   code exchange, token refresh, session metadata) behind the
//!   [`AuthProvider`] trait.
//! - [`client`]: the agreement-scoped REST API (status, thermostat writes,
//!   webhook management) behind the [`ThermostatApi`] trait.
//!
//! Both traits are the seams the rest of the SDK is written against, so the
//! session and device layers can be exercised with the in-memory doubles in
//! [`mock`] (enabled with the `test-support` feature).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use toon_api::{StaticToken, ThermostatApi, ToonClient};
//!
//! # async fn example() -> toon_api::Result<()> {
//! let client = ToonClient::new(
//!     toon_api::DEFAULT_API_BASE_URL.parse()?,
//!     Arc::new(StaticToken::new("access-token")),
//! );
//! for agreement in client.agreements().await? {
//!     println!("{} ({})", agreement.display_common_name, agreement.agreement_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
pub mod oauth;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use client::{
    ClientFactory, StaticToken, ThermostatApi, TokenSource, ToonClient, ToonClientFactory,
    DEFAULT_API_BASE_URL,
};
pub use error::{ApiError, Result};
pub use models::{
    Agreement, GasUsage, PowerUsage, ProgramState, SessionInfo, StatusEnvelope, ThermostatInfo,
    ThermostatStateEntry, Token, TokenResponse, Webhook, WEBHOOK_ACTIONS,
};
pub use oauth::{AuthProvider, OAuthConfig, ToonOAuth, DEFAULT_TENANT_ID, ISSUER};
