//! Routing of inbound callbacks to channels.
//!
//! The `EventRouter` keeps the set of device keys that may receive webhook
//! pushes and forwards accepted requests to the consumer's channels.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

/// A webhook push for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookPayload {
    /// Path segment the push arrived on
    pub device_key: String,
    /// Parsed JSON body, unvalidated
    pub body: Value,
}

/// Query of the authorization redirect.
///
/// The provider sends either `code` or `error`, always with the `state` the
/// flow was started with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OAuthRedirect {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Routes inbound callbacks to channels.
#[derive(Clone)]
pub struct EventRouter {
    /// Device keys accepted on `/webhook/{key}`
    devices: Arc<RwLock<HashSet<String>>>,
    webhook_sender: mpsc::UnboundedSender<WebhookPayload>,
    oauth_sender: mpsc::UnboundedSender<OAuthRedirect>,
}

impl EventRouter {
    /// # Example
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use callback_server::router::EventRouter;
    ///
    /// let (webhook_tx, _webhook_rx) = mpsc::unbounded_channel();
    /// let (oauth_tx, _oauth_rx) = mpsc::unbounded_channel();
    /// let router = EventRouter::new(webhook_tx, oauth_tx);
    /// ```
    pub fn new(
        webhook_sender: mpsc::UnboundedSender<WebhookPayload>,
        oauth_sender: mpsc::UnboundedSender<OAuthRedirect>,
    ) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashSet::new())),
            webhook_sender,
            oauth_sender,
        }
    }

    /// Accept webhook pushes for `device_key`.
    pub async fn register(&self, device_key: impl Into<String>) {
        self.devices.write().await.insert(device_key.into());
    }

    pub async fn unregister(&self, device_key: &str) -> bool {
        self.devices.write().await.remove(device_key)
    }

    pub async fn is_registered(&self, device_key: &str) -> bool {
        self.devices.read().await.contains(device_key)
    }

    /// Forward a push. Returns `false` if the key is not registered.
    pub async fn route_webhook(&self, device_key: String, body: Value) -> bool {
        if !self.devices.read().await.contains(&device_key) {
            return false;
        }

        // Receiver gone means the consumer is shutting down; nothing to do.
        let _ = self.webhook_sender.send(WebhookPayload { device_key, body });
        true
    }

    /// Forward an authorization redirect. Returns `false` if nobody listens.
    pub fn route_redirect(&self, redirect: OAuthRedirect) -> bool {
        self.oauth_sender.send(redirect).is_ok()
    }
}
