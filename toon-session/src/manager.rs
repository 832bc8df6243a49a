//! Session manager
//!
//! Drives the OAuth2 authorization-code handshake, persists the resulting
//! session and keeps the set of managed devices bound to the active client.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use toon_api::{AuthProvider, ClientFactory, ThermostatApi};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::session::{Session, SessionBinding, SessionEvent, SessionState};
use crate::store::SessionStore;
use crate::tokens::SessionTokenSource;

/// Error type devices report from [`ManagedDevice::rebind`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const EVENT_CAPACITY: usize = 64;
const CALLBACK_CAPACITY: usize = 8;

/// A device whose API client follows the active session.
#[async_trait]
pub trait ManagedDevice: Send + Sync {
    /// Key the device is registered under.
    fn device_id(&self) -> &str;

    /// Switch the device to `client`, which belongs to `session`.
    async fn rebind(
        &self,
        client: Arc<dyn ThermostatApi>,
        session: &SessionBinding,
    ) -> std::result::Result<(), BoxError>;

    /// Mark the device unavailable. Calling this twice is harmless.
    fn set_unavailable(&self, reason: &str);
}

/// Result of the provider's authorization redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationCallback {
    Code { code: String, state: String },
    Denied { error: String, state: String },
}

impl AuthorizationCallback {
    pub fn state(&self) -> &str {
        match self {
            Self::Code { state, .. } | Self::Denied { state, .. } => state,
        }
    }
}

/// A device that could not be moved onto a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindFailure {
    pub device_id: String,
    pub message: String,
}

/// A completed login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub session: SessionBinding,
    pub rebind_failures: Vec<RebindFailure>,
}

impl LoginOutcome {
    /// Turn collected rebind failures into an error.
    pub fn into_result(self) -> Result<SessionBinding> {
        if self.rebind_failures.is_empty() {
            Ok(self.session)
        } else {
            Err(SessionError::DeviceRebind(self.rebind_failures))
        }
    }
}

struct ActiveSession {
    client: Arc<dyn ThermostatApi>,
    binding: SessionBinding,
}

/// Owner of the installation's single session.
///
/// # Example
///
/// ```rust,ignore
/// let manager = SessionManager::new("default", store, provider, factory);
/// let mut events = manager.subscribe_events();
///
/// // Somebody has to deliver the redirect, usually the callback server.
/// let callbacks = manager.authorization_sender();
///
/// let outcome = manager.login().await?;
/// println!("Logged in to {}", outcome.session.title);
/// ```
pub struct SessionManager {
    config_id: String,
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn AuthProvider>,
    factory: Arc<dyn ClientFactory>,

    state: RwLock<SessionState>,
    active: RwLock<Option<ActiveSession>>,
    devices: RwLock<HashMap<String, Arc<dyn ManagedDevice>>>,

    events: broadcast::Sender<SessionEvent>,
    callback_tx: RwLock<Option<mpsc::Sender<AuthorizationCallback>>>,
    callback_rx: Mutex<mpsc::Receiver<AuthorizationCallback>>,
}

impl SessionManager {
    pub fn new(
        config_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn AuthProvider>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (callback_tx, callback_rx) = mpsc::channel(CALLBACK_CAPACITY);

        Self {
            config_id: config_id.into(),
            store,
            provider,
            factory,
            state: RwLock::new(SessionState::Unauthenticated),
            active: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            events,
            callback_tx: RwLock::new(Some(callback_tx)),
            callback_rx: Mutex::new(callback_rx),
        }
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Client of the active session, if any.
    pub fn client(&self) -> Option<Arc<dyn ThermostatApi>> {
        self.active.read().as_ref().map(|a| a.client.clone())
    }

    /// Identity of the active session, if any.
    pub fn binding(&self) -> Option<SessionBinding> {
        self.active.read().as_ref().map(|a| a.binding.clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Channel on which authorization redirects are delivered.
    ///
    /// Returns `None` after [`close_authorization`](Self::close_authorization).
    pub fn authorization_sender(&self) -> Option<mpsc::Sender<AuthorizationCallback>> {
        self.callback_tx.read().clone()
    }

    /// Drop the manager's own callback sender.
    ///
    /// Once every other sender is gone too, a waiting login fails with
    /// [`SessionError::CallbackClosed`].
    pub fn close_authorization(&self) {
        self.callback_tx.write().take();
    }

    /// True iff exactly one session is persisted.
    pub async fn is_authenticated(&self) -> Result<bool> {
        let sessions = self.store.load_all().await?;
        match sessions.len() {
            0 => Ok(false),
            1 => Ok(true),
            count => Err(SessionError::SessionIntegrity { count }),
        }
    }

    /// Resume a persisted session without a handshake.
    ///
    /// Returns `None` when nothing is stored.
    pub async fn restore(&self) -> Result<Option<LoginOutcome>> {
        let mut sessions = self.store.load_all().await?;
        let session = match sessions.len() {
            0 => return Ok(None),
            1 => sessions.remove(0),
            count => return Err(SessionError::SessionIntegrity { count }),
        };

        info!("Restoring session {} ({})", session.session_id, session.title);
        let binding = session.binding();
        let client = self.activate(session);
        let rebind_failures = self.rebind_all(&client, &binding).await;

        Ok(Some(LoginOutcome {
            session: binding,
            rebind_failures,
        }))
    }

    /// Run the authorization-code handshake.
    pub async fn login(&self) -> Result<LoginOutcome> {
        let mut guard = LoginGuard::begin(self)?;

        // A stored credential is reused as the pending candidate.
        let pending_id = self
            .store
            .load_all()
            .await?
            .into_iter()
            .next()
            .map(|s| s.session_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        debug!("Starting login with pending session {}", pending_id);

        let url = self.provider.authorization_url(&pending_id);
        self.emit(SessionEvent::AuthorizationUrl(url));

        let code = self.wait_for_code(&pending_id).await?;

        let token = match self.provider.exchange_code(&code).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Authorization code exchange failed: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let info = match self.provider.session_info(&token).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to fetch session metadata: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
                return Err(e.into());
            }
        };

        let session = Session {
            session_id: info.id,
            config_id: self.config_id.clone(),
            token,
            title: info.title,
        };

        // The pending credential is replaced by the provider-assigned one.
        for stale in self.store.load_all().await? {
            if stale.session_id != session.session_id {
                debug!("Discarding stored session {}", stale.session_id);
                self.store.remove(&stale.session_id).await?;
            }
        }
        self.store.save(&session).await?;

        let binding = session.binding();
        let client = self.activate(session);
        guard.complete();

        info!("Authorized session {} ({})", binding.session_id, binding.title);
        self.emit(SessionEvent::Authorized {
            session_id: binding.session_id.clone(),
            title: binding.title.clone(),
        });

        let rebind_failures = self.rebind_all(&client, &binding).await;
        Ok(LoginOutcome {
            session: binding,
            rebind_failures,
        })
    }

    /// Remove the persisted session and mark every device unavailable.
    pub async fn logout(&self) -> Result<()> {
        let sessions = self.store.load_all().await?;
        let session = match sessions.as_slice() {
            [] => return Err(SessionError::NotAuthenticated),
            [session] => session,
            _ => {
                return Err(SessionError::SessionIntegrity {
                    count: sessions.len(),
                })
            }
        };

        self.store.remove(&session.session_id).await?;
        self.active.write().take();
        *self.state.write() = SessionState::Unauthenticated;

        let devices: Vec<_> = self.devices.read().values().cloned().collect();
        for device in devices {
            device.set_unavailable("Logged out");
        }

        info!("Logged out of session {}", session.session_id);
        self.emit(SessionEvent::LoggedOut {
            session_id: session.session_id.clone(),
        });
        Ok(())
    }

    /// Add a device to the managed set, replacing one with the same id.
    pub fn register_device(&self, device: Arc<dyn ManagedDevice>) {
        let id = device.device_id().to_string();
        debug!("Managing device {}", id);
        self.devices.write().insert(id, device);
    }

    pub fn unregister_device(&self, device_id: &str) -> Option<Arc<dyn ManagedDevice>> {
        self.devices.write().remove(device_id)
    }

    pub fn managed_devices(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    async fn wait_for_code(&self, pending_id: &str) -> Result<String> {
        let mut rx = self.callback_rx.lock().await;
        loop {
            let callback = rx.recv().await.ok_or(SessionError::CallbackClosed)?;
            if callback.state() != pending_id {
                warn!(
                    "Ignoring authorization callback for unknown state {}",
                    callback.state()
                );
                continue;
            }

            return match callback {
                AuthorizationCallback::Code { code, .. } => Ok(code),
                AuthorizationCallback::Denied { error, .. } => {
                    warn!("Authorization denied: {}", error);
                    self.emit(SessionEvent::Error(error.clone()));
                    Err(SessionError::Denied(error))
                }
            };
        }
    }

    fn activate(&self, session: Session) -> Arc<dyn ThermostatApi> {
        let binding = session.binding();
        let tokens = Arc::new(SessionTokenSource::new(
            session,
            self.store.clone(),
            self.provider.clone(),
        ));
        let client = self.factory.create(tokens);

        *self.active.write() = Some(ActiveSession {
            client: client.clone(),
            binding,
        });
        *self.state.write() = SessionState::Authenticated;
        client
    }

    async fn rebind_all(
        &self,
        client: &Arc<dyn ThermostatApi>,
        binding: &SessionBinding,
    ) -> Vec<RebindFailure> {
        let devices: Vec<_> = self.devices.read().values().cloned().collect();
        let mut failures = Vec::new();

        for device in devices {
            if let Err(e) = device.rebind(client.clone(), binding).await {
                let failure = RebindFailure {
                    device_id: device.device_id().to_string(),
                    message: e.to_string(),
                };
                warn!(
                    "Failed to rebind device {}: {}",
                    failure.device_id, failure.message
                );
                self.emit(SessionEvent::RebindFailed {
                    device_id: failure.device_id.clone(),
                    message: failure.message.clone(),
                });
                failures.push(failure);
            }
        }

        failures
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Holds the manager in `Authenticating` for the duration of a login.
///
/// Dropping it without [`complete`](LoginGuard::complete), including when the
/// login future itself is dropped, falls back to `Authenticated` if a
/// previous session is still active and `Unauthenticated` otherwise.
struct LoginGuard<'a> {
    manager: &'a SessionManager,
    done: bool,
}

impl<'a> LoginGuard<'a> {
    fn begin(manager: &'a SessionManager) -> Result<Self> {
        let mut state = manager.state.write();
        if *state == SessionState::Authenticating {
            return Err(SessionError::LoginInProgress);
        }
        *state = SessionState::Authenticating;
        Ok(Self {
            manager,
            done: false,
        })
    }

    fn complete(&mut self) {
        self.done = true;
    }
}

impl Drop for LoginGuard<'_> {
    /// A failed re-login falls back to `Authenticated` while a session is still active.
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let fallback = if self.manager.active.read().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
        *self.manager.state.write() = fallback;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use chrono::Utc;
    use toon_api::mock::{MockAuthProvider, MockClientFactory};
    use toon_api::Token;

    fn stored(id: &str) -> Session {
        Session {
            session_id: id.to_string(),
            config_id: "default".to_string(),
            token: Token {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
            title: "Home".to_string(),
        }
    }

    fn manager(sessions: Vec<Session>) -> SessionManager {
        SessionManager::new(
            "default",
            Arc::new(MemorySessionStore::with_sessions(sessions)),
            Arc::new(MockAuthProvider::new("agreement-1", "Home")),
            Arc::new(MockClientFactory::default()),
        )
    }

    #[test]
    fn test_callback_state_accessor() {
        let code = AuthorizationCallback::Code {
            code: "c".into(),
            state: "s1".into(),
        };
        let denied = AuthorizationCallback::Denied {
            error: "access_denied".into(),
            state: "s2".into(),
        };
        assert_eq!(code.state(), "s1");
        assert_eq!(denied.state(), "s2");
    }

    #[test]
    fn test_login_guard_rejects_second_login() {
        let manager = manager(vec![]);
        let guard = LoginGuard::begin(&manager).unwrap();
        assert_eq!(manager.state(), SessionState::Authenticating);
        assert!(matches!(
            LoginGuard::begin(&manager),
            Err(SessionError::LoginInProgress)
        ));

        drop(guard);
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_failed_relogin_keeps_active_session() {
        let manager = manager(vec![stored("agreement-1")]);
        manager.restore().await.unwrap().unwrap();

        let guard = LoginGuard::begin(&manager).unwrap();
        assert_eq!(manager.state(), SessionState::Authenticating);
        drop(guard);

        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(manager.client().is_some());
    }

    #[tokio::test]
    async fn test_restore_activates_single_session() {
        let manager = manager(vec![stored("agreement-1")]);
        let outcome = manager.restore().await.unwrap().unwrap();

        assert_eq!(outcome.session.session_id, "agreement-1");
        assert!(outcome.rebind_failures.is_empty());
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert!(manager.client().is_some());
    }

    #[tokio::test]
    async fn test_restore_without_session() {
        let manager = manager(vec![]);
        assert!(manager.restore().await.unwrap().is_none());
        assert_eq!(manager.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_restore_rejects_multiple_sessions() {
        let manager = manager(vec![stored("a"), stored("b")]);
        assert!(matches!(
            manager.restore().await,
            Err(SessionError::SessionIntegrity { count: 2 })
        ));
    }

    #[test]
    fn test_outcome_into_result() {
        let binding = stored("a").binding();
        let ok = LoginOutcome {
            session: binding.clone(),
            rebind_failures: vec![],
        };
        assert_eq!(ok.into_result().unwrap(), binding);

        let failed = LoginOutcome {
            session: binding,
            rebind_failures: vec![RebindFailure {
                device_id: "d".into(),
                message: "m".into(),
            }],
        };
        assert!(matches!(
            failed.into_result(),
            Err(SessionError::DeviceRebind(f)) if f.len() == 1
        ));
    }
}
