//! End-to-end tests of the hub: real callback server, in-memory provider.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rstest::rstest;
use serde_json::json;
use task_queue::TokioClock;
use tokio::sync::broadcast;
use toon_api::mock::{MockAuthProvider, MockClientFactory, MockThermostatApi};
use toon_api::{Agreement, Token};
use toon_sdk::{
    Availability, Capability, CapabilityValue, HubComponents, HubConfig, HubError,
    MemorySessionStore, SessionError, SessionEvent, ToonHub,
};
use toon_session::Session;

const DEVICE_ID: &str = "eneco-001-123456";
const AGREEMENT_ID: &str = "12345";

struct Fixture {
    hub: Arc<ToonHub>,
    api: Arc<MockThermostatApi>,
    provider: Arc<MockAuthProvider>,
    http: reqwest::Client,
}

impl Fixture {
    fn local(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.hub.port(), path)
    }
}

fn agreement(agreement_id: &str, common_name: &str) -> Agreement {
    Agreement {
        agreement_id: agreement_id.to_string(),
        display_common_name: common_name.to_string(),
        street: "Kerkstraat".to_string(),
        house_number: "1".to_string(),
        postal_code: "3511AB".to_string(),
        city: "Utrecht".to_string(),
    }
}

fn stored_session() -> Session {
    Session {
        session_id: "session-1".to_string(),
        config_id: "default".to_string(),
        token: Token {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        },
        title: "Kerkstraat 1".to_string(),
    }
}

async fn start(ports: (u16, u16), logged_in: bool, api: MockThermostatApi) -> Fixture {
    let api = Arc::new(api);
    let provider = Arc::new(MockAuthProvider::new("session-1", "Kerkstraat 1"));
    let store = if logged_in {
        MemorySessionStore::with_sessions([stored_session()])
    } else {
        MemorySessionStore::new()
    };

    let config = HubConfig {
        callback_port_range: ports,
        poll_interval: Duration::from_millis(100),
        ..HubConfig::new("client", "secret")
    };
    let hub = ToonHub::start_with(
        config,
        HubComponents {
            store: Arc::new(store),
            provider: provider.clone(),
            factory: Arc::new(MockClientFactory::new(api.clone())),
            clock: Arc::new(TokioClock),
        },
    )
    .await
    .expect("hub starts");

    Fixture {
        hub: Arc::new(hub),
        api,
        provider,
        http: reqwest::Client::new(),
    }
}

fn thermostat_api() -> MockThermostatApi {
    MockThermostatApi::new()
        .with_agreements(vec![agreement(AGREEMENT_ID, DEVICE_ID)])
        .with_status(json!({
            "thermostatInfo": { "currentDisplayTemp": 1950, "currentSetpoint": 2000 }
        }))
}

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

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn test_login_through_redirect() {
    let fx = start((53100, 53200), false, thermostat_api()).await;
    assert!(!fx.hub.is_authenticated().await.unwrap());

    let mut events = fx.hub.session_events();
    let login = tokio::spawn({
        let hub = fx.hub.clone();
        async move { hub.login().await }
    });
    let state = pending_state(&mut events).await;

    let response = fx
        .http
        .get(fx.local(&format!("/oauth/callback?code=abc&state={state}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let outcome = login.await.unwrap().unwrap();
    assert_eq!(outcome.session.session_id, "session-1");
    assert!(outcome.rebind_failures.is_empty());
    assert!(fx.hub.is_authenticated().await.unwrap());
    assert_eq!(fx.provider.exchanged_codes(), vec!["abc".to_string()]);

    fx.hub.shutdown().await.unwrap();
}

#[rstest]
#[case::denied((53200, 53300), "error=access_denied")]
#[case::foreign_state_then_denied((53300, 53400), "code=stolen&state=other")]
#[tokio::test]
async fn test_login_rejections(#[case] ports: (u16, u16), #[case] first_query: &str) {
    let fx = start(ports, false, thermostat_api()).await;

    let mut events = fx.hub.session_events();
    let login = tokio::spawn({
        let hub = fx.hub.clone();
        async move { hub.login().await }
    });
    let state = pending_state(&mut events).await;

    // A query without its own state is sent for the pending login.
    let query = if first_query.contains("state=") {
        first_query.to_string()
    } else {
        format!("{first_query}&state={state}")
    };
    fx.http
        .get(fx.local(&format!("/oauth/callback?{query}")))
        .send()
        .await
        .unwrap();
    if first_query.contains("state=") {
        fx.http
            .get(fx.local(&format!("/oauth/callback?error=access_denied&state={state}")))
            .send()
            .await
            .unwrap();
    }

    let err = login.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Session(SessionError::Denied(_))));
    assert!(!fx.hub.is_authenticated().await.unwrap());
    assert!(fx.provider.exchanged_codes().is_empty());

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pairing_requires_session() {
    let fx = start((53400, 53500), false, thermostat_api()).await;

    let err = fx
        .hub
        .add_device(&agreement(AGREEMENT_ID, DEVICE_ID))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HubError::Session(SessionError::NotAuthenticated)
    ));
    assert!(matches!(
        fx.hub.pairing_candidates().await,
        Err(HubError::Session(SessionError::NotAuthenticated))
    ));

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_paired_device_receives_pushes() {
    let fx = start((53500, 53600), true, thermostat_api()).await;
    assert!(fx.hub.is_authenticated().await.unwrap());

    let candidates = fx.hub.pairing_candidates().await.unwrap();
    assert_eq!(candidates.len(), 1);
    let device = fx.hub.add_device(&candidates[0]).await.unwrap();

    assert!(device.is_available());
    assert_eq!(device.name(), "Kerkstraat 1, 3511AB Utrecht");
    // Initial poll
    assert_eq!(
        device.capability(Capability::MeasureTemperature).await,
        Some(CapabilityValue::Number(19.5))
    );

    let api = fx.api.clone();
    eventually(move || {
        let api = api.clone();
        async move { api.subscribe_calls() == 1 }
    })
    .await;
    let registration = &fx.api.registrations()[0];
    assert_eq!(registration.application_id, "toon-sdk");
    assert!(registration
        .callback_url
        .ends_with(&format!("/webhook/{DEVICE_ID}")));

    assert!(fx.hub.pairing_candidates().await.unwrap().is_empty());
    assert!(Arc::ptr_eq(
        &fx.hub.add_device(&candidates[0]).await.unwrap(),
        &device
    ));

    let response = fx
        .http
        .post(fx.local(&format!("/webhook/{DEVICE_ID}")))
        .json(&json!({
            "commonName": DEVICE_ID,
            "updateDataSet": { "thermostatInfo": { "currentSetpoint": 2150 } }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let pushed = device.clone();
    eventually(move || {
        let device = pushed.clone();
        async move {
            device.capability(Capability::TargetTemperature).await
                == Some(CapabilityValue::Number(21.5))
        }
    })
    .await;

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_device() {
    let fx = start((53600, 53700), true, thermostat_api()).await;
    fx.hub
        .add_device(&agreement(AGREEMENT_ID, DEVICE_ID))
        .await
        .unwrap();

    fx.hub.remove_device(DEVICE_ID).await.unwrap();

    assert!(fx.hub.device(DEVICE_ID).is_none());
    assert!(fx.hub.session().managed_devices().is_empty());
    assert_eq!(fx.api.unsubscribed(), vec!["toon-sdk".to_string()]);

    let response = fx
        .http
        .post(fx.local(&format!("/webhook/{DEVICE_ID}")))
        .json(&json!({ "commonName": DEVICE_ID }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    assert!(matches!(
        fx.hub.remove_device(DEVICE_ID).await,
        Err(HubError::DeviceNotFound(_))
    ));

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pairing_foreign_agreement_fails() {
    let fx = start((53700, 53800), true, thermostat_api()).await;

    let err = fx
        .hub
        .add_device(&agreement("99999", "eneco-002-999999"))
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::Pairing { .. }));
    assert!(fx.hub.devices().is_empty());
    assert!(fx.hub.session().managed_devices().is_empty());

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poll_loop_refreshes_devices() {
    let fx = start((53800, 53900), true, thermostat_api()).await;
    let device = fx
        .hub
        .add_device(&agreement(AGREEMENT_ID, DEVICE_ID))
        .await
        .unwrap();

    fx.api.set_status(json!({
        "thermostatInfo": { "currentDisplayTemp": 2230 }
    }));

    let polled = device.clone();
    eventually(move || {
        let device = polled.clone();
        async move {
            device.capability(Capability::MeasureTemperature).await
                == Some(CapabilityValue::Number(22.3))
        }
    })
    .await;

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logout_marks_devices_unavailable() {
    let fx = start((53900, 54000), true, thermostat_api()).await;
    let device = fx
        .hub
        .add_device(&agreement(AGREEMENT_ID, DEVICE_ID))
        .await
        .unwrap();

    fx.hub.logout().await.unwrap();

    assert!(!fx.hub.is_authenticated().await.unwrap());
    assert_eq!(
        device.availability(),
        Availability::Unavailable("Logged out".to_string())
    );
    assert!(matches!(
        fx.hub.logout().await,
        Err(HubError::Session(SessionError::NotAuthenticated))
    ));

    fx.hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_ends_pending_login() {
    let fx = start((54000, 54100), false, thermostat_api()).await;

    let mut events = fx.hub.session_events();
    let login = tokio::spawn({
        let hub = fx.hub.clone();
        async move { hub.login().await }
    });
    pending_state(&mut events).await;

    fx.hub.shutdown().await.unwrap();

    let err = login.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        HubError::Session(SessionError::CallbackClosed)
    ));
    assert!(matches!(
        fx.hub.add_device(&agreement(AGREEMENT_ID, DEVICE_ID)).await,
        Err(HubError::ShutDown)
    ));
    // Idempotent
    tokio_test::assert_ok!(fx.hub.shutdown().await);
}

#[tokio::test]
async fn test_start_rejects_invalid_config() {
    let result = ToonHub::start_with(
        HubConfig::default(),
        HubComponents {
            store: Arc::new(MemorySessionStore::new()),
            provider: Arc::new(MockAuthProvider::new("s", "t")),
            factory: Arc::new(MockClientFactory::default()),
            clock: Arc::new(TokioClock),
        },
    )
    .await;

    assert!(matches!(result, Err(HubError::Config(_))));
}
