//! In-memory doubles of the provider traits.
//!
//! Enabled for this crate's own tests and, through the `test-support`
//! feature, for the tests of downstream crates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::client::{ClientFactory, ThermostatApi, TokenSource};
use crate::error::{ApiError, Result};
use crate::models::{Agreement, SessionInfo, ThermostatInfo, Token, Webhook};
use crate::oauth::AuthProvider;

/// Scriptable [`ThermostatApi`].
#[derive(Debug, Default)]
pub struct MockThermostatApi {
    agreements: Mutex<Vec<Agreement>>,
    status: Mutex<Value>,
    webhooks: Mutex<Vec<Webhook>>,
    writes: Mutex<Vec<(String, ThermostatInfo)>>,
    registrations: Mutex<Vec<Webhook>>,
    unsubscribed: Mutex<Vec<String>>,
    subscribe_calls: AtomicU32,
    subscribe_failures: AtomicU32,
    subscribe_delay: Mutex<Option<Duration>>,
    fail_writes: Mutex<bool>,
    fail_unsubscribe: Mutex<bool>,
}

impl MockThermostatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agreements(self, agreements: Vec<Agreement>) -> Self {
        *self.agreements.lock() = agreements;
        self
    }

    pub fn with_status(self, status: Value) -> Self {
        *self.status.lock() = status;
        self
    }

    pub fn with_webhooks(self, webhooks: Vec<Webhook>) -> Self {
        *self.webhooks.lock() = webhooks;
        self
    }

    /// Fail the next `times` subscribe calls; `u32::MAX` fails forever.
    pub fn fail_subscribe(self, times: u32) -> Self {
        self.subscribe_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Make every subscribe call take `delay` before answering.
    pub fn with_subscribe_delay(self, delay: Duration) -> Self {
        *self.subscribe_delay.lock() = Some(delay);
        self
    }

    /// Replace the status returned by later polls.
    pub fn set_status(&self, status: Value) {
        *self.status.lock() = status;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        *self.fail_unsubscribe.lock() = fail;
    }

    pub fn writes(&self) -> Vec<(String, ThermostatInfo)> {
        self.writes.lock().clone()
    }

    pub fn registrations(&self) -> Vec<Webhook> {
        self.registrations.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThermostatApi for MockThermostatApi {
    async fn agreements(&self) -> Result<Vec<Agreement>> {
        Ok(self.agreements.lock().clone())
    }

    async fn status(&self, _agreement_id: &str) -> Result<Value> {
        Ok(self.status.lock().clone())
    }

    async fn update_thermostat(&self, agreement_id: &str, info: &ThermostatInfo) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(ApiError::Http {
                status: 500,
                message: "thermostat unavailable".to_string(),
            });
        }
        self.writes
            .lock()
            .push((agreement_id.to_string(), info.clone()));
        Ok(())
    }

    async fn webhooks(&self, _agreement_id: &str) -> Result<Vec<Webhook>> {
        Ok(self.webhooks.lock().clone())
    }

    async fn subscribe(&self, _agreement_id: &str, webhook: &Webhook) -> Result<()> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.subscribe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.subscribe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.subscribe_failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(ApiError::Network("connection reset".to_string()));
        }

        self.registrations.lock().push(webhook.clone());
        self.webhooks.lock().push(webhook.clone());
        Ok(())
    }

    async fn unsubscribe(&self, _agreement_id: &str, application_id: &str) -> Result<()> {
        if *self.fail_unsubscribe.lock() {
            return Err(ApiError::Network("connection reset".to_string()));
        }
        self.unsubscribed.lock().push(application_id.to_string());
        self.webhooks
            .lock()
            .retain(|hook| hook.application_id != application_id);
        Ok(())
    }
}

/// Scriptable [`AuthProvider`].
#[derive(Debug)]
pub struct MockAuthProvider {
    session: Mutex<SessionInfo>,
    fail_exchange: Mutex<bool>,
    fail_refresh: Mutex<bool>,
    exchanged_codes: Mutex<Vec<String>>,
    refresh_calls: AtomicU32,
    token_lifetime: Mutex<chrono::Duration>,
}

impl MockAuthProvider {
    pub fn new(session_id: &str, title: &str) -> Self {
        Self {
            session: Mutex::new(SessionInfo {
                id: session_id.to_string(),
                title: title.to_string(),
            }),
            fail_exchange: Mutex::new(false),
            fail_refresh: Mutex::new(false),
            exchanged_codes: Mutex::new(Vec::new()),
            refresh_calls: AtomicU32::new(0),
            token_lifetime: Mutex::new(chrono::Duration::hours(1)),
        }
    }

    pub fn set_fail_exchange(&self, fail: bool) {
        *self.fail_exchange.lock() = fail;
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        *self.fail_refresh.lock() = fail;
    }

    /// Lifetime of tokens handed out from now on.
    pub fn set_token_lifetime(&self, lifetime: chrono::Duration) {
        *self.token_lifetime.lock() = lifetime;
    }

    pub fn set_session(&self, session_id: &str, title: &str) {
        *self.session.lock() = SessionInfo {
            id: session_id.to_string(),
            title: title.to_string(),
        };
    }

    pub fn exchanged_codes(&self) -> Vec<String> {
        self.exchanged_codes.lock().clone()
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn token(&self, access_token: String) -> Token {
        Token {
            access_token,
            refresh_token: "refresh-token".to_string(),
            expires_at: Utc::now() + *self.token_lifetime.lock(),
        }
    }
}

#[async_trait]
impl AuthProvider for MockAuthProvider {
    fn authorization_url(&self, state: &str) -> Url {
        let mut url = Url::parse("https://auth.example.com/authorize").expect("static URL");
        url.query_pairs_mut().append_pair("state", state);
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<Token> {
        self.exchanged_codes.lock().push(code.to_string());
        if *self.fail_exchange.lock() {
            return Err(ApiError::Auth("invalid_grant".to_string()));
        }
        Ok(self.token(format!("access-{code}")))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Token> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_refresh.lock() {
            return Err(ApiError::Auth("refresh rejected".to_string()));
        }
        Ok(self.token(format!("refreshed-{call}")))
    }

    async fn session_info(&self, _token: &Token) -> Result<SessionInfo> {
        Ok(self.session.lock().clone())
    }
}

/// [`ClientFactory`] that hands out one shared [`MockThermostatApi`].
///
/// The token source of the most recent client is kept so tests can check
/// which credential a client was built over.
#[derive(Default)]
pub struct MockClientFactory {
    api: Arc<MockThermostatApi>,
    created: AtomicU32,
    last_tokens: Mutex<Option<Arc<dyn TokenSource>>>,
}

impl MockClientFactory {
    pub fn new(api: Arc<MockThermostatApi>) -> Self {
        Self {
            api,
            created: AtomicU32::new(0),
            last_tokens: Mutex::new(None),
        }
    }

    pub fn api(&self) -> Arc<MockThermostatApi> {
        self.api.clone()
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_tokens(&self) -> Option<Arc<dyn TokenSource>> {
        self.last_tokens.lock().clone()
    }
}

impl ClientFactory for MockClientFactory {
    fn create(&self, tokens: Arc<dyn TokenSource>) -> Arc<dyn ThermostatApi> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.last_tokens.lock() = Some(tokens);
        self.api.clone()
    }
}
