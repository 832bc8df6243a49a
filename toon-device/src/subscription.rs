//! Webhook subscription scheduler
//!
//! Keeps one device's webhook registration alive:
//!
//! ```text
//! Idle ──register──▶ Registering ──ok──▶ Active ──TTL timer──▶ Registering
//!                         │
//!                         └── retries exhausted ──▶ Idle (+ warning)
//! ```
//!
//! Registration goes through a [`RetryRunner`] with exponential backoff
//! (6s, 12s, 24s, ...). Only one registration runs per device at a time; a
//! second call while one is in flight returns
//! [`SubscriptionError::AlreadyRegistering`] without touching the provider.
//!
//! The renewal cadence is entirely server driven: every payload carrying a
//! time-to-live re-arms the single renewal timer.
//!
//! Teardown is final. A registration still retrying when it happens stops at
//! its next attempt, and a subscribe that lands after it is undone.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use task_queue::{Clock, IntervalPolicy, RetryRunner, SingleSlotTimer};
use toon_api::{ApiError, ThermostatApi, Webhook};
use tracing::{debug, error, info, warn};

use crate::error::SubscriptionError;

/// Retry settings and identity of a webhook registration.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Identifies our registrations among the agreement's webhooks
    pub application_id: String,
    pub callback_url: String,
    pub max_retries: u32,
    /// Delay after the first failure; doubled after each further failure
    pub base_delay: Duration,
}

impl SubscriptionConfig {
    pub fn new(application_id: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            callback_url: callback_url.into(),
            max_retries: 10,
            base_delay: Duration::from_millis(6000),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Idle,
    Registering,
    Active,
}

/// Snapshot of a device's subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub status: SubscriptionStatus,
    pub registering: bool,
    /// When the provider will drop the registration unless renewed
    pub expires_at: Option<DateTime<Utc>>,
    /// Failed attempts of the current or last registration
    pub retry_count: u32,
    /// Set when a registration gave up; cleared by the next success
    pub warning: Option<String>,
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self {
            status: SubscriptionStatus::Idle,
            registering: false,
            expires_at: None,
            retry_count: 0,
            warning: None,
        }
    }
}

pub struct SubscriptionScheduler {
    agreement_id: String,
    config: SubscriptionConfig,
    runner: RetryRunner,
    policy: IntervalPolicy,
    renewal: SingleSlotTimer,
    registering: AtomicBool,
    torn_down: AtomicBool,
    state: Mutex<SubscriptionState>,
}

impl SubscriptionScheduler {
    pub fn new(
        agreement_id: impl Into<String>,
        config: SubscriptionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let agreement_id = agreement_id.into();
        let policy = IntervalPolicy::exponential(config.base_delay);
        Self {
            renewal: SingleSlotTimer::new(format!("renewal:{agreement_id}"), clock.clone()),
            runner: RetryRunner::new(clock),
            policy,
            agreement_id,
            config,
            registering: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            state: Mutex::new(SubscriptionState::default()),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.lock().clone()
    }

    pub fn warning(&self) -> Option<String> {
        self.state.lock().warning.clone()
    }

    pub fn is_renewal_armed(&self) -> bool {
        self.renewal.is_armed()
    }

    /// Register the webhook, retrying with backoff.
    pub async fn register(&self, client: Arc<dyn ThermostatApi>) -> Result<(), SubscriptionError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SubscriptionError::TornDown);
        }
        if self
            .registering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Registration for {} already in flight", self.agreement_id);
            return Err(SubscriptionError::AlreadyRegistering);
        }
        let _flag = RegisteringFlag(&self.registering);

        {
            let mut state = self.state.lock();
            state.status = SubscriptionStatus::Registering;
            state.registering = true;
            state.retry_count = 0;
        }

        let webhook = Webhook::new(&self.config.application_id, &self.config.callback_url);
        let torn_down = &self.torn_down;
        let result = self
            .runner
            .run(
                |attempt| {
                    self.state.lock().retry_count = attempt - 1;
                    let client = client.clone();
                    let webhook = webhook.clone();
                    let agreement_id = self.agreement_id.clone();
                    async move {
                        register_once(client.as_ref(), &agreement_id, &webhook, torn_down).await
                    }
                },
                self.config.max_retries,
                &self.policy,
            )
            .await;

        let mut state = self.state.lock();
        state.registering = false;
        match result {
            Ok(Attempt::Abandoned) => {
                debug!("Registration for {} stopped by teardown", self.agreement_id);
                state.status = SubscriptionStatus::Idle;
                Err(SubscriptionError::TornDown)
            }
            Ok(Attempt::Subscribed) => {
                info!(
                    "Webhook registered for agreement {} at {}",
                    self.agreement_id, self.config.callback_url
                );
                state.status = SubscriptionStatus::Active;
                state.retry_count = 0;
                state.warning = None;
                Ok(())
            }
            Err(e) => {
                let attempts = self.config.max_retries + 1;
                error!(
                    "Giving up on webhook registration for agreement {} after {} attempts: {}",
                    self.agreement_id, attempts, e
                );
                state.status = SubscriptionStatus::Idle;
                state.retry_count = self.config.max_retries;
                state.warning = Some(format!("Live updates unavailable: {e}"));
                Err(SubscriptionError::Exhausted {
                    attempts,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Replace the pending renewal with `task`, due after `ttl`.
    pub fn schedule_renewal<F>(&self, ttl: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self.state.lock().expires_at = expires_at;

        debug!("Renewing subscription for {} in {:?}", self.agreement_id, ttl);
        self.renewal.arm(ttl, task);
    }

    /// Cancel renewal and remove the registration. Unsubscribe failures are
    /// logged only.
    pub async fn teardown(&self, client: Option<Arc<dyn ThermostatApi>>) {
        self.torn_down.store(true, Ordering::Release);
        self.renewal.cancel();
        {
            let mut state = self.state.lock();
            state.status = SubscriptionStatus::Idle;
            state.expires_at = None;
        }

        let Some(client) = client else {
            return;
        };
        match client
            .unsubscribe(&self.agreement_id, &self.config.application_id)
            .await
        {
            Ok(()) => debug!("Unsubscribed webhook for {}", self.agreement_id),
            Err(e) => warn!("Failed to unsubscribe webhook for {}: {}", self.agreement_id, e),
        }
    }
}

impl std::fmt::Debug for SubscriptionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionScheduler")
            .field("agreement_id", &self.agreement_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Clears the in-flight flag even when the registration future is dropped.
struct RegisteringFlag<'a>(&'a AtomicBool);

impl Drop for RegisteringFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Subscribed,
    /// Teardown happened first; nothing is left registered
    Abandoned,
}

/// One registration attempt: drop a stale registration of ours, then subscribe.
async fn register_once(
    client: &dyn ThermostatApi,
    agreement_id: &str,
    webhook: &Webhook,
    torn_down: &AtomicBool,
) -> Result<Attempt, ApiError> {
    if torn_down.load(Ordering::Acquire) {
        return Ok(Attempt::Abandoned);
    }
    let existing = client.webhooks(agreement_id).await?;
    if existing
        .iter()
        .any(|hook| hook.application_id == webhook.application_id)
    {
        debug!("Removing stale webhook {} for {}", webhook.application_id, agreement_id);
        client
            .unsubscribe(agreement_id, &webhook.application_id)
            .await?;
    }
    if torn_down.load(Ordering::Acquire) {
        return Ok(Attempt::Abandoned);
    }
    client.subscribe(agreement_id, webhook).await?;

    if torn_down.load(Ordering::Acquire) {
        debug!("Undoing webhook {} registered after teardown", agreement_id);
        if let Err(e) = client
            .unsubscribe(agreement_id, &webhook.application_id)
            .await
        {
            warn!("Failed to undo webhook for {}: {}", agreement_id, e);
        }
        return Ok(Attempt::Abandoned);
    }
    Ok(Attempt::Subscribed)
}
