//! Bearer tokens for API clients, refreshed on demand.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use toon_api::{ApiError, AuthProvider, Token, TokenSource};
use tracing::{debug, warn};

use crate::session::Session;
use crate::store::SessionStore;

/// Refresh this long before the provider-reported expiry.
const REFRESH_LEEWAY_SECS: i64 = 60;

/// [`TokenSource`] backed by a persisted session.
///
/// A refreshed token is written back to the store, but only while the session
/// record still exists: once the user logs out, the source stops handing out
/// tokens instead of resurrecting the session.
pub struct SessionTokenSource {
    session: Mutex<Session>,
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn AuthProvider>,
}

impl SessionTokenSource {
    pub fn new(
        session: Session,
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            session: Mutex::new(session),
            store,
            provider,
        }
    }

    /// Current token without triggering a refresh.
    pub async fn current(&self) -> Token {
        self.session.lock().await.token.clone()
    }

    async fn session_exists(&self, session_id: &str) -> Result<bool, ApiError> {
        let sessions = self
            .store
            .load_all()
            .await
            .map_err(|e| ApiError::Auth(format!("Cannot read session store: {e}")))?;
        Ok(sessions.iter().any(|s| s.session_id == session_id))
    }
}

#[async_trait]
impl TokenSource for SessionTokenSource {
    async fn access_token(&self) -> toon_api::Result<String> {
        let mut session = self.session.lock().await;
        let now = Utc::now();
        if !session
            .token
            .expires_within(now, Duration::seconds(REFRESH_LEEWAY_SECS))
        {
            return Ok(session.token.access_token.clone());
        }

        if !self.session_exists(&session.session_id).await? {
            return Err(ApiError::Auth(format!(
                "Session {} no longer exists",
                session.session_id
            )));
        }

        debug!("Refreshing access token for session {}", session.session_id);
        let refreshed = self.provider.refresh(&session.token.refresh_token).await?;
        session.token = refreshed;

        // Logout may have raced the refresh; never write a removed session back.
        if self.session_exists(&session.session_id).await? {
            if let Err(e) = self.store.save(&session).await {
                warn!(
                    "Failed to persist refreshed token for session {}: {}",
                    session.session_id, e
                );
            }
        }

        Ok(session.token.access_token.clone())
    }
}
