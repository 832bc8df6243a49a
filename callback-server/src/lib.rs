//! Inbound HTTP for toon-sdk.
//!
//! A small warp server with two endpoints:
//!
//! - `POST /webhook/{device_key}`: status pushes from the provider. The JSON
//!   body is routed as a [`WebhookPayload`] if `device_key` is registered with
//!   the [`EventRouter`]; unknown keys get `404`, bodies that are not JSON get
//!   `400`.
//! - `GET /oauth/callback?code=..&state=..`: the browser redirect at the end
//!   of the authorization flow, forwarded as an [`OAuthRedirect`].
//!
//! The server knows nothing about devices or sessions. Consumers own the
//! receiving ends of the channels and decide what a payload means.
//!
//! # Example
//!
//! ```no_run
//! use callback_server::{CallbackServer, OAuthRedirect, WebhookPayload};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), callback_server::CallbackError> {
//!     let (webhook_tx, mut webhook_rx) = mpsc::unbounded_channel::<WebhookPayload>();
//!     let (oauth_tx, _oauth_rx) = mpsc::unbounded_channel::<OAuthRedirect>();
//!
//!     let server = CallbackServer::new((3500, 3600), webhook_tx, oauth_tx).await?;
//!     server.router().register("eneco-001-123456").await;
//!     println!("Webhook URL: {}", server.webhook_url("eneco-001-123456"));
//!
//!     while let Some(push) = webhook_rx.recv().await {
//!         println!("{} -> {}", push.device_key, push.body);
//!     }
//!     server.shutdown().await
//! }
//! ```

pub mod router;
mod server;

pub use router::{EventRouter, OAuthRedirect, WebhookPayload};
pub use server::{CallbackError, CallbackServer};
