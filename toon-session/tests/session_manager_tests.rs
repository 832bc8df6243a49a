//! End-to-end tests of the session lifecycle against the in-memory provider.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rstest::rstest;
use tokio::sync::broadcast;
use toon_api::mock::{MockAuthProvider, MockClientFactory};
use toon_api::{ThermostatApi, Token, TokenSource};
use toon_session::{
    AuthorizationCallback, BoxError, ManagedDevice, MemorySessionStore, Session, SessionBinding,
    SessionError, SessionEvent, SessionManager, SessionState, SessionStore,
};

struct Fixture {
    manager: Arc<SessionManager>,
    store: Arc<MemorySessionStore>,
    provider: Arc<MockAuthProvider>,
    factory: Arc<MockClientFactory>,
}

fn fixture(sessions: Vec<Session>) -> Fixture {
    let store = Arc::new(MemorySessionStore::with_sessions(sessions));
    let provider = Arc::new(MockAuthProvider::new("agreement-1", "Kerkstraat 1, Utrecht"));
    let factory = Arc::new(MockClientFactory::default());
    let manager = Arc::new(SessionManager::new(
        "default",
        store.clone(),
        provider.clone(),
        factory.clone(),
    ));
    Fixture {
        manager,
        store,
        provider,
        factory,
    }
}

fn stored(id: &str) -> Session {
    Session {
        session_id: id.to_string(),
        config_id: "default".to_string(),
        token: Token {
            access_token: format!("access-{id}"),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        },
        title: format!("Toon {id}"),
    }
}

/// Wait for the authorization URL and return its `state` parameter.
async fn pending_state(events: &mut broadcast::Receiver<SessionEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("authorization URL published")
            .expect("event channel open");
        if let SessionEvent::AuthorizationUrl(url) = event {
            return url
                .query_pairs()
                .find(|(k, _)| k == "state")
                .map(|(_, v)| v.into_owned())
                .expect("state parameter");
        }
    }
}

async fn complete_login(
    fx: &Fixture,
    code: &str,
) -> Result<toon_session::LoginOutcome, SessionError> {
    let mut events = fx.manager.subscribe_events();
    let manager = fx.manager.clone();
    let login = tokio::spawn(async move { manager.login().await });

    let state = pending_state(&mut events).await;
    fx.manager
        .authorization_sender()
        .unwrap()
        .send(AuthorizationCallback::Code {
            code: code.to_string(),
            state,
        })
        .await
        .unwrap();

    login.await.unwrap()
}

#[derive(Default)]
struct FakeDevice {
    id: String,
    fail_rebind: bool,
    rebinds: Mutex<Vec<SessionBinding>>,
    unavailable: AtomicU32,
}

impl FakeDevice {
    fn new(id: &str, fail_rebind: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fail_rebind,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ManagedDevice for FakeDevice {
    fn device_id(&self) -> &str {
        &self.id
    }

    async fn rebind(
        &self,
        _client: Arc<dyn ThermostatApi>,
        session: &SessionBinding,
    ) -> Result<(), BoxError> {
        if self.fail_rebind {
            return Err("agreement not found".into());
        }
        self.rebinds.lock().push(session.clone());
        Ok(())
    }

    fn set_unavailable(&self, _reason: &str) {
        self.unavailable.fetch_add(1, Ordering::SeqCst);
    }
}

#[rstest]
#[case::none(vec![], false)]
#[case::one(vec![stored("a")], true)]
#[tokio::test]
async fn test_is_authenticated(#[case] sessions: Vec<Session>, #[case] expected: bool) {
    let fx = fixture(sessions);
    assert_eq!(fx.manager.is_authenticated().await.unwrap(), expected);
}

#[tokio::test]
async fn test_is_authenticated_fails_on_two_sessions() {
    let fx = fixture(vec![stored("a"), stored("b")]);
    let err = fx.manager.is_authenticated().await.unwrap_err();
    assert!(matches!(err, SessionError::SessionIntegrity { count: 2 }));
}

#[tokio::test]
async fn test_logout_without_session() {
    let fx = fixture(vec![]);
    let err = fx.manager.logout().await.unwrap_err();
    assert!(matches!(err, SessionError::NotAuthenticated));
}

#[tokio::test]
async fn test_logout_removes_session_and_marks_devices() {
    let fx = fixture(vec![stored("agreement-1")]);
    fx.manager.restore().await.unwrap();
    let device = FakeDevice::new("eneco-001", false);
    fx.manager.register_device(device.clone());

    tokio_test::assert_ok!(fx.manager.logout().await);

    assert!(fx.store.load_all().await.unwrap().is_empty());
    assert!(!fx.manager.is_authenticated().await.unwrap());
    assert!(fx.manager.client().is_none());
    assert_eq!(fx.manager.state(), SessionState::Unauthenticated);
    assert_eq!(device.unavailable.load(Ordering::SeqCst), 1);

    // A second logout finds nothing to remove.
    assert!(matches!(
        fx.manager.logout().await,
        Err(SessionError::NotAuthenticated)
    ));
    assert_eq!(device.unavailable.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_logout_refuses_multiple_sessions() {
    let fx = fixture(vec![stored("a"), stored("b")]);
    assert!(matches!(
        fx.manager.logout().await,
        Err(SessionError::SessionIntegrity { count: 2 })
    ));
    assert_eq!(fx.store.load_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_login_persists_provider_session() {
    let fx = fixture(vec![]);
    let mut events = fx.manager.subscribe_events();

    let outcome = complete_login(&fx, "code-1").await.unwrap();

    assert_eq!(outcome.session.session_id, "agreement-1");
    assert_eq!(outcome.session.title, "Kerkstraat 1, Utrecht");
    assert!(outcome.rebind_failures.is_empty());
    assert_eq!(fx.provider.exchanged_codes(), vec!["code-1".to_string()]);

    let sessions = fx.store.load_all().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, "agreement-1");
    assert_eq!(sessions[0].token.access_token, "access-code-1");

    assert_eq!(fx.manager.state(), SessionState::Authenticated);
    assert!(fx.manager.client().is_some());
    assert_eq!(fx.factory.created(), 1);

    let mut saw_authorized = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Authorized { session_id, .. } = event {
            assert_eq!(session_id, "agreement-1");
            saw_authorized = true;
        }
    }
    assert!(saw_authorized);
}

#[tokio::test]
async fn test_login_reuses_stored_session_id_as_state() {
    let fx = fixture(vec![stored("old-agreement")]);
    let mut events = fx.manager.subscribe_events();
    let manager = fx.manager.clone();
    let login = tokio::spawn(async move { manager.login().await });

    let state = pending_state(&mut events).await;
    assert_eq!(state, "old-agreement");

    fx.manager
        .authorization_sender()
        .unwrap()
        .send(AuthorizationCallback::Code {
            code: "code-2".into(),
            state,
        })
        .await
        .unwrap();
    login.await.unwrap().unwrap();

    // The old record is replaced, never duplicated.
    let sessions = fx.store.load_all().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, "agreement-1");
}

#[tokio::test]
async fn test_login_ignores_mismatched_state() {
    let fx = fixture(vec![]);
    let mut events = fx.manager.subscribe_events();
    let manager = fx.manager.clone();
    let login = tokio::spawn(async move { manager.login().await });

    let state = pending_state(&mut events).await;
    let sender = fx.manager.authorization_sender().unwrap();
    sender
        .send(AuthorizationCallback::Code {
            code: "forged".into(),
            state: "somebody-else".into(),
        })
        .await
        .unwrap();
    sender
        .send(AuthorizationCallback::Code {
            code: "genuine".into(),
            state,
        })
        .await
        .unwrap();

    login.await.unwrap().unwrap();
    assert_eq!(fx.provider.exchanged_codes(), vec!["genuine".to_string()]);
}

#[tokio::test]
async fn test_login_exchange_failure() {
    let fx = fixture(vec![]);
    fx.provider.set_fail_exchange(true);
    let mut events = fx.manager.subscribe_events();

    let err = complete_login(&fx, "bad-code").await.unwrap_err();

    assert!(matches!(err, SessionError::Auth(_)));
    assert_eq!(fx.manager.state(), SessionState::Unauthenticated);
    assert!(fx.store.load_all().await.unwrap().is_empty());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::Error(_)) {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn test_login_denied() {
    let fx = fixture(vec![]);
    let mut events = fx.manager.subscribe_events();
    let manager = fx.manager.clone();
    let login = tokio::spawn(async move { manager.login().await });

    let state = pending_state(&mut events).await;
    fx.manager
        .authorization_sender()
        .unwrap()
        .send(AuthorizationCallback::Denied {
            error: "access_denied".into(),
            state,
        })
        .await
        .unwrap();

    let err = login.await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Denied(ref e) if e == "access_denied"));
    assert_eq!(fx.manager.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_concurrent_login_is_rejected() {
    let fx = fixture(vec![]);
    let mut events = fx.manager.subscribe_events();
    let manager = fx.manager.clone();
    let first = tokio::spawn(async move { manager.login().await });
    let _ = pending_state(&mut events).await;

    assert!(matches!(
        fx.manager.login().await,
        Err(SessionError::LoginInProgress)
    ));

    first.abort();
    let _ = first.await;
    assert_eq!(fx.manager.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_login_fails_when_callbacks_closed() {
    let fx = fixture(vec![]);
    fx.manager.close_authorization();
    assert!(fx.manager.authorization_sender().is_none());

    let err = fx.manager.login().await.unwrap_err();
    assert!(matches!(err, SessionError::CallbackClosed));
}

#[tokio::test]
async fn test_login_rebinds_devices_and_collects_failures() {
    let fx = fixture(vec![]);
    let good = FakeDevice::new("eneco-001", false);
    let bad = FakeDevice::new("eneco-002", true);
    fx.manager.register_device(good.clone());
    fx.manager.register_device(bad.clone());

    let outcome = complete_login(&fx, "code").await.unwrap();

    assert_eq!(good.rebinds.lock().len(), 1);
    assert_eq!(good.rebinds.lock()[0].session_id, "agreement-1");
    assert_eq!(outcome.rebind_failures.len(), 1);
    assert_eq!(outcome.rebind_failures[0].device_id, "eneco-002");
    assert_eq!(outcome.rebind_failures[0].message, "agreement not found");

    // The batch failure does not undo the login.
    assert_eq!(fx.manager.state(), SessionState::Authenticated);
    assert!(matches!(
        outcome.into_result(),
        Err(SessionError::DeviceRebind(_))
    ));
}

#[tokio::test]
async fn test_unregistered_device_is_not_rebound() {
    let fx = fixture(vec![stored("agreement-1")]);
    let device = FakeDevice::new("eneco-001", false);
    fx.manager.register_device(device.clone());
    assert!(fx.manager.unregister_device("eneco-001").is_some());

    fx.manager.restore().await.unwrap();
    assert!(device.rebinds.lock().is_empty());
}

#[tokio::test]
async fn test_client_token_source_refreshes_expiring_token() {
    let mut session = stored("agreement-1");
    session.token.expires_at = Utc::now() + chrono::Duration::seconds(10);
    let fx = fixture(vec![session]);
    fx.manager.restore().await.unwrap();

    let tokens = fx.factory.last_tokens().unwrap();
    assert_eq!(tokens.access_token().await.unwrap(), "refreshed-1");
    assert_eq!(fx.provider.refresh_calls(), 1);
    assert_eq!(
        fx.store.load_all().await.unwrap()[0].token.access_token,
        "refreshed-1"
    );
}

#[tokio::test]
async fn test_token_source_stops_after_logout() {
    let mut session = stored("agreement-1");
    session.token.expires_at = Utc::now();
    let fx = fixture(vec![session]);
    fx.manager.restore().await.unwrap();
    let tokens = fx.factory.last_tokens().unwrap();

    fx.manager.logout().await.unwrap();

    assert!(tokens.access_token().await.is_err());
    assert!(fx.store.load_all().await.unwrap().is_empty());
}
