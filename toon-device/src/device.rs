//! The thermostat device.
//!
//! A [`Device`] owns everything known about one installation: the last
//! thermostat object, usage figures, the preset table and the capability
//! values derived from them. Push and poll payloads both enter through
//! [`Device::handle_payload`] and are applied in arrival order under the
//! device's state lock.
//!
//! The API client is not owned by the device. The session manager swaps it
//! through [`ManagedDevice::rebind`] whenever the session changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use task_queue::{Clock, DebounceError, Debouncer};
use tokio::sync::{broadcast, Mutex};
use toon_api::{ApiError, ProgramState, StatusEnvelope, ThermostatApi, ThermostatInfo};
use toon_session::{BoxError, ManagedDevice, SessionBinding};
use tracing::{debug, info, warn};

use crate::capability::{Capability, CapabilityStore, CapabilityValue};
use crate::error::{DeviceError, Result, SubscriptionError};
use crate::reconciler::{reconcile, CapabilityUpdate, DeviceState, PayloadKind, ReconcileContext};
use crate::subscription::{SubscriptionConfig, SubscriptionScheduler, SubscriptionState};
use crate::temperature_state::TemperatureState;

const EVENT_CAPACITY: usize = 128;

/// Static description of a paired thermostat.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// The thermostat's common name; payloads for other names are ignored
    pub device_id: String,
    pub agreement_id: String,
    pub name: String,
    pub subscription: SubscriptionConfig,
    /// Quiet window for coalescing target temperature writes
    pub write_debounce: Duration,
}

impl DeviceConfig {
    pub fn new(
        device_id: impl Into<String>,
        agreement_id: impl Into<String>,
        subscription: SubscriptionConfig,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            name: device_id.clone(),
            device_id,
            agreement_id: agreement_id.into(),
            subscription,
            write_debounce: Duration::from_millis(500),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_write_debounce(mut self, window: Duration) -> Self {
        self.write_debounce = window;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

/// Change notifications published by a device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    CapabilityAdded {
        device_id: String,
        capability: Capability,
    },
    CapabilityChanged {
        device_id: String,
        capability: Capability,
        value: CapabilityValue,
    },
    AvailabilityChanged {
        device_id: String,
        availability: Availability,
    },
}

struct Inner {
    state: DeviceState,
    capabilities: CapabilityStore,
}

pub struct Device {
    config: DeviceConfig,
    me: Weak<Device>,
    client: RwLock<Option<Arc<dyn ThermostatApi>>>,
    session: RwLock<Option<SessionBinding>>,
    availability: RwLock<Availability>,
    removed: AtomicBool,
    inner: Mutex<Inner>,
    subscription: SubscriptionScheduler,
    target_writer: Debouncer<f64, Result<()>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl Device {
    /// Create an unbound device. It stays unavailable until a client is
    /// attached or the session manager rebinds it.
    pub fn new(config: DeviceConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Device>| {
            let writer = me.clone();
            let target_writer =
                Debouncer::new(config.write_debounce, clock.clone(), move |target: f64| {
                    let writer = writer.clone();
                    async move {
                        match writer.upgrade() {
                            Some(device) => device.write_target_temperature(target).await,
                            None => Err(DeviceError::Cancelled),
                        }
                    }
                    .boxed()
                });

            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            Self {
                subscription: SubscriptionScheduler::new(
                    config.agreement_id.clone(),
                    config.subscription.clone(),
                    clock,
                ),
                config,
                me: me.clone(),
                client: RwLock::new(None),
                session: RwLock::new(None),
                availability: RwLock::new(Availability::Unavailable("Not connected".to_string())),
                removed: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    state: DeviceState::default(),
                    capabilities: CapabilityStore::with_defaults(),
                }),
                target_writer,
                events,
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.config.device_id
    }

    pub fn agreement_id(&self) -> &str {
        &self.config.agreement_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn availability(&self) -> Availability {
        self.availability.read().clone()
    }

    pub fn is_available(&self) -> bool {
        *self.availability.read() == Availability::Available
    }

    /// Session the current client belongs to, if the device was rebound.
    pub fn session(&self) -> Option<SessionBinding> {
        self.session.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    /// Warning left by a failed subscription, shown to the user as is.
    pub fn warning(&self) -> Option<String> {
        self.subscription.warning()
    }

    pub async fn state(&self) -> DeviceState {
        self.inner.lock().await.state.clone()
    }

    pub async fn capability(&self, capability: Capability) -> Option<CapabilityValue> {
        self.inner.lock().await.capabilities.get(capability).cloned()
    }

    pub async fn capabilities(&self) -> Vec<(Capability, CapabilityValue)> {
        let inner = self.inner.lock().await;
        inner
            .capabilities
            .capabilities()
            .filter_map(|c| inner.capabilities.get(c).map(|v| (c, v.clone())))
            .collect()
    }

    /// Use `client` for every further request.
    pub fn attach(&self, client: Arc<dyn ThermostatApi>) {
        *self.client.write() = Some(client);
        self.set_availability(Availability::Available);
    }

    fn client(&self) -> Result<Arc<dyn ThermostatApi>> {
        self.client.read().clone().ok_or(DeviceError::NotBound)
    }

    /// Register the webhook, retrying with backoff until it sticks or the
    /// retries run out.
    pub async fn register_subscription(&self) -> Result<()> {
        if self.removed.load(Ordering::Acquire) {
            return Err(SubscriptionError::NotBound.into());
        }
        let client = self
            .client
            .read()
            .clone()
            .ok_or(SubscriptionError::NotBound)?;
        self.subscription.register(client).await?;
        Ok(())
    }

    /// Start a registration in the background.
    pub fn spawn_registration(&self) {
        let Some(device) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            device.register_logged().await;
        });
    }

    async fn register_logged(&self) {
        match self.register_subscription().await {
            Ok(()) => {}
            Err(DeviceError::Subscription(SubscriptionError::AlreadyRegistering)) => {
                debug!("Skipping registration for {}, one is in flight", self.id());
            }
            Err(DeviceError::Subscription(SubscriptionError::TornDown)) => {
                debug!("Registration for {} abandoned after removal", self.id());
            }
            Err(e) => warn!("Webhook registration for {} failed: {}", self.id(), e),
        }
    }

    /// Merge a status payload. Never fails; the returned kind says what
    /// happened to it.
    pub async fn handle_payload(&self, payload: &Value) -> PayloadKind {
        let (kind, ttl, events) = {
            let mut inner = self.inner.lock().await;
            let ctx = ReconcileContext {
                device_id: &self.config.device_id,
                capabilities: &inner.capabilities,
            };
            let result = reconcile(&inner.state, payload, &ctx);

            let mut events = Vec::new();
            for update in result.updates {
                self.apply_update(&mut inner.capabilities, update, &mut events);
            }
            inner.state = result.state;
            (result.kind, result.ttl, events)
        };

        for event in events {
            self.emit(event);
        }

        if let Some(ttl) = ttl {
            self.schedule_renewal(ttl);
        }
        kind
    }

    /// Fetch the status and merge it like a push.
    pub async fn poll(&self) -> Result<PayloadKind> {
        let client = self.client()?;
        let status = client.status(&self.config.agreement_id).await?;
        let payload =
            serde_json::to_value(StatusEnvelope::from_poll(status)).map_err(ApiError::from)?;
        Ok(self.handle_payload(&payload).await)
    }

    /// Set the setpoint, rounded to the nearest half degree.
    ///
    /// The capability changes immediately. Calls arriving within the debounce
    /// window collapse into one write of the last value, and every caller
    /// gets that write's result. A failed write keeps the new value.
    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        let target = round_to_half(celsius);
        self.update_capability(Capability::TargetTemperature, CapabilityValue::Number(target))
            .await;

        match self.target_writer.call(target).await {
            Ok(result) => result,
            Err(DebounceError::Cancelled) => Err(DeviceError::Cancelled),
        }
    }

    async fn write_target_temperature(&self, target: f64) -> Result<()> {
        let setpoint = (target * 100.0).round() as i64;
        self.write_thermostat(|info| {
            info.with_setpoint(setpoint)
                .with_program_state(ProgramState::Override)
                .with_active_state(TemperatureState::None.id())
        })
        .await?;

        // A manual setpoint overrides whatever preset was active.
        self.update_capability(Capability::TemperatureState, CapabilityValue::Unset)
            .await;
        Ok(())
    }

    /// Activate a preset. With `resume` the program takes over again at its
    /// next switch point; without it the preset is held.
    ///
    /// A held preset is written as manual (0), unlike a setpoint write which uses override (2).
    pub async fn set_preset(&self, preset: TemperatureState, resume: bool) -> Result<()> {
        let program = if resume {
            ProgramState::Override
        } else {
            ProgramState::Manual
        };
        self.write_thermostat(|info| {
            info.with_active_state(preset.id())
                .with_program_state(program)
        })
        .await?;

        self.update_capability(
            Capability::TemperatureState,
            CapabilityValue::Text(preset.as_str().to_string()),
        )
        .await;

        if !preset.is_sentinel() {
            let setpoint = self.inner.lock().await.state.preset_temperature(preset);
            if let Some(celsius) = setpoint {
                self.update_capability(
                    Capability::TargetTemperature,
                    CapabilityValue::Number(celsius),
                )
                .await;
            }
        }
        Ok(())
    }

    pub async fn enable_program(&self) -> Result<()> {
        self.write_thermostat(|info| info.with_program_state(ProgramState::Program))
            .await
            .map(|_| ())
    }

    pub async fn disable_program(&self) -> Result<()> {
        self.write_thermostat(|info| info.with_program_state(ProgramState::Manual))
            .await
            .map(|_| ())
    }

    /// Merge a change into the last thermostat object and send it whole.
    async fn write_thermostat<F>(&self, change: F) -> Result<ThermostatInfo>
    where
        F: FnOnce(ThermostatInfo) -> ThermostatInfo,
    {
        let client = self.client()?;
        let baseline = self
            .inner
            .lock()
            .await
            .state
            .thermostat_info
            .clone()
            .ok_or(DeviceError::NoBaseline)?;
        let merged = change(baseline);

        if let Err(e) = client
            .update_thermostat(&self.config.agreement_id, &merged)
            .await
        {
            warn!("Thermostat write for {} failed: {}", self.id(), e);
            return Err(DeviceError::Write(e.to_string()));
        }

        debug!("Thermostat write for {} accepted", self.id());
        self.inner.lock().await.state.thermostat_info = Some(merged.clone());
        Ok(merged)
    }

    /// Stop renewing and remove the webhook. Best effort.
    pub async fn teardown(&self) {
        self.removed.store(true, Ordering::Release);
        let client = self.client.read().clone();
        self.subscription.teardown(client).await;
        info!("Device {} removed", self.id());
    }

    fn schedule_renewal(&self, ttl: Duration) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        let device = self.me.clone();
        self.subscription.schedule_renewal(ttl, async move {
            if let Some(device) = device.upgrade() {
                device.register_logged().await;
            }
        });
    }

    async fn update_capability(&self, capability: Capability, value: CapabilityValue) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            self.apply_update(
                &mut inner.capabilities,
                CapabilityUpdate::Set(capability, value),
                &mut events,
            );
        }
        for event in events {
            self.emit(event);
        }
    }

    fn apply_update(
        &self,
        capabilities: &mut CapabilityStore,
        update: CapabilityUpdate,
        events: &mut Vec<DeviceEvent>,
    ) {
        match update {
            CapabilityUpdate::Add(capability) => {
                if capabilities.add(capability) {
                    debug!("Device {} now exposes {}", self.id(), capability);
                    events.push(DeviceEvent::CapabilityAdded {
                        device_id: self.id().to_string(),
                        capability,
                    });
                }
            }
            CapabilityUpdate::Set(capability, value) => {
                match capabilities.set(capability, value.clone()) {
                    Ok(true) => events.push(DeviceEvent::CapabilityChanged {
                        device_id: self.id().to_string(),
                        capability,
                        value,
                    }),
                    Ok(false) => {}
                    Err(e) => warn!("Skipping {} on {}: {}", capability, self.id(), e),
                }
            }
        }
    }

    fn set_availability(&self, availability: Availability) {
        {
            let mut current = self.availability.write();
            if *current == availability {
                return;
            }
            *current = availability.clone();
        }
        self.emit(DeviceEvent::AvailabilityChanged {
            device_id: self.id().to_string(),
            availability,
        });
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ManagedDevice for Device {
    fn device_id(&self) -> &str {
        &self.config.device_id
    }

    async fn rebind(
        &self,
        client: Arc<dyn ThermostatApi>,
        session: &SessionBinding,
    ) -> std::result::Result<(), BoxError> {
        let agreements = client.agreements().await.map_err(DeviceError::from)?;
        if !agreements
            .iter()
            .any(|a| a.agreement_id == self.config.agreement_id)
        {
            self.set_unavailable("Thermostat not found for this account");
            return Err(DeviceError::AgreementNotFound(self.config.agreement_id.clone()).into());
        }

        *self.session.write() = Some(session.clone());
        self.attach(client);
        info!("Device {} moved to session {}", self.id(), session.session_id);

        self.spawn_registration();
        Ok(())
    }

    fn set_unavailable(&self, reason: &str) {
        self.set_availability(Availability::Unavailable(reason.to_string()));
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.config.device_id)
            .field("agreement_id", &self.config.agreement_id)
            .field("availability", &*self.availability.read())
            .finish()
    }
}

/// Round to the nearest 0.5 °C.
pub fn round_to_half(celsius: f64) -> f64 {
    (celsius * 2.0).round() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_to_half() {
        assert_eq!(round_to_half(21.3), 21.5);
        assert_eq!(round_to_half(21.2), 21.0);
        assert_eq!(round_to_half(19.75), 20.0);
        assert_eq!((round_to_half(21.3) * 100.0).round() as i64, 2150);
    }

    proptest! {
        #[test]
        fn prop_rounded_setpoint_is_multiple_of_fifty(celsius in 5.0f64..30.0) {
            let setpoint = (round_to_half(celsius) * 100.0).round() as i64;
            prop_assert_eq!(setpoint % 50, 0);
            prop_assert!((round_to_half(celsius) - celsius).abs() <= 0.25 + f64::EPSILON);
        }
    }
}
