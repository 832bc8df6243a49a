//! Status reconciliation
//!
//! Merges a status payload, pushed by webhook or fetched by polling, into a
//! device's state and derives the capability values that changed.
//!
//! Payload shape:
//!
//! ```json
//! {
//!   "commonName": "eneco-001-123456",
//!   "timeToLiveSeconds": 300,
//!   "updateDataSet": {
//!     "thermostatInfo": { "currentDisplayTemp": 2045, "currentSetpoint": 2100, "activeState": 1 },
//!     "thermostatStates": { "state": [{ "id": 0, "tempValue": 2000 }] },
//!     "powerUsage": { "value": 350, "dayUsage": 5000, "dayLowUsage": 3000 },
//!     "gasUsage": { "dayUsage": 1000 }
//!   }
//! }
//! ```
//!
//! Every field is converted on its own. A field that does not convert is
//! logged and left out of the merge, while its siblings and any fields this
//! crate does not know still apply. Reconciliation never fails.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use toon_api::{GasUsage, PowerUsage, StatusEnvelope, ThermostatInfo, ThermostatStateEntry};
use tracing::{debug, warn};

use crate::capability::{Capability, CapabilityStore, CapabilityValue};
use crate::temperature_state::TemperatureState;

/// In-memory state of one thermostat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    /// Last thermostat object received; every write merges into it
    pub thermostat_info: Option<ThermostatInfo>,
    pub power_usage: Option<PowerUsage>,
    pub gas_usage: Option<GasUsage>,
    /// Preset id to setpoint in hundredths of a degree
    pub temperature_states: BTreeMap<i64, i64>,
}

impl DeviceState {
    /// Setpoint of `preset` in °C, if the preset table has been received.
    pub fn preset_temperature(&self, preset: TemperatureState) -> Option<f64> {
        self.temperature_states
            .get(&preset.id())
            .map(|raw| hundredths_to_celsius(*raw))
    }
}

/// What reconciliation needs to know about the device.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub device_id: &'a str,
    pub capabilities: &'a CapabilityStore,
}

/// A capability change requested by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityUpdate {
    /// Expose a capability the device did not have yet
    Add(Capability),
    Set(Capability, CapabilityValue),
}

/// How a payload was treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    /// Data was merged
    Applied,
    /// Envelope without data
    Heartbeat,
    /// Addressed to a different device
    Foreign(String),
    /// Not an envelope at all
    Malformed(String),
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub kind: PayloadKind,
    pub state: DeviceState,
    pub updates: Vec<CapabilityUpdate>,
    /// Server-declared lifetime of the webhook subscription
    pub ttl: Option<Duration>,
}

impl Reconciliation {
    fn unchanged(kind: PayloadKind, state: &DeviceState, ttl: Option<Duration>) -> Self {
        Self {
            kind,
            state: state.clone(),
            updates: Vec::new(),
            ttl,
        }
    }
}

/// Merge `payload` into `state`.
pub fn reconcile(state: &DeviceState, payload: &Value, ctx: &ReconcileContext<'_>) -> Reconciliation {
    let envelope: StatusEnvelope = match serde_json::from_value(payload.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Ignoring payload for {} that is not an envelope: {}", ctx.device_id, e);
            return Reconciliation::unchanged(PayloadKind::Malformed(e.to_string()), state, None);
        }
    };

    if let Some(origin) = envelope.common_name.as_deref() {
        if origin != ctx.device_id {
            debug!("Ignoring payload for {} on device {}", origin, ctx.device_id);
            return Reconciliation::unchanged(PayloadKind::Foreign(origin.to_string()), state, None);
        }
    }

    let ttl = envelope.time_to_live_seconds.map(Duration::from_secs);

    let data = match envelope.update_data_set {
        Some(Value::Object(data)) => data,
        Some(other) => {
            warn!("Ignoring updateDataSet of unexpected type for {}: {}", ctx.device_id, other);
            return Reconciliation::unchanged(PayloadKind::Heartbeat, state, ttl);
        }
        None => return Reconciliation::unchanged(PayloadKind::Heartbeat, state, ttl),
    };

    let mut merge = Merge {
        device_id: ctx.device_id,
        state: state.clone(),
        updates: Vec::new(),
    };

    if let Some(entries) = merge.preset_entries(&data) {
        merge.thermostat_states(entries);
    }
    if let Some(mut power) = merge.object(&data, "powerUsage") {
        merge.keep_valid::<f64>("powerUsage", &mut power, "value");
        merge.keep_valid::<f64>("powerUsage", &mut power, "dayUsage");
        merge.keep_valid::<f64>("powerUsage", &mut power, "dayLowUsage");
        if let Some(power) = merge.typed::<PowerUsage>("powerUsage", power) {
            merge.power_usage(power);
        }
    }
    if let Some(mut gas) = merge.object(&data, "gasUsage") {
        merge.keep_valid::<f64>("gasUsage", &mut gas, "value");
        merge.keep_valid::<f64>("gasUsage", &mut gas, "dayUsage");
        if let Some(gas) = merge.typed::<GasUsage>("gasUsage", gas) {
            merge.gas_usage(gas);
        }
    }
    if let Some(mut info) = merge.object(&data, "thermostatInfo") {
        merge.keep_valid::<i64>("thermostatInfo", &mut info, "currentDisplayTemp");
        merge.keep_valid::<i64>("thermostatInfo", &mut info, "currentSetpoint");
        merge.keep_valid::<i64>("thermostatInfo", &mut info, "programState");
        merge.keep_valid::<i64>("thermostatInfo", &mut info, "activeState");
        merge.keep_valid::<f64>("thermostatInfo", &mut info, "currentHumidity");
        if let Some(info) = merge.typed::<ThermostatInfo>("thermostatInfo", info) {
            merge.thermostat_info(info, ctx.capabilities);
        }
    }

    Reconciliation {
        kind: PayloadKind::Applied,
        state: merge.state,
        updates: merge.updates,
        ttl,
    }
}

struct Merge<'a> {
    device_id: &'a str,
    state: DeviceState,
    updates: Vec<CapabilityUpdate>,
}

impl Merge<'_> {
    fn object(&self, data: &Map<String, Value>, key: &str) -> Option<Map<String, Value>> {
        match data.get(key)? {
            Value::Object(section) => Some(section.clone()),
            other => {
                warn!("Skipping {} of unexpected type for {}: {}", key, self.device_id, other);
                None
            }
        }
    }

    /// Drop `field` from `section` when it does not convert to `T`.
    fn keep_valid<T: DeserializeOwned>(
        &self,
        key: &str,
        section: &mut Map<String, Value>,
        field: &str,
    ) {
        let Some(raw) = section.get(field) else {
            return;
        };
        if let Err(e) = serde_json::from_value::<Option<T>>(raw.clone()) {
            warn!("Skipping malformed {}.{} for {}: {}", key, field, self.device_id, e);
            section.remove(field);
        }
    }

    fn typed<T: DeserializeOwned>(&self, key: &str, section: Map<String, Value>) -> Option<T> {
        match serde_json::from_value(Value::Object(section)) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!("Skipping malformed {} for {}: {}", key, self.device_id, e);
                None
            }
        }
    }

    fn preset_entries(&self, data: &Map<String, Value>) -> Option<Vec<ThermostatStateEntry>> {
        let section = self.object(data, "thermostatStates")?;
        let entries = match section.get("state")? {
            Value::Array(entries) => entries,
            other => {
                warn!(
                    "Skipping thermostatStates.state of unexpected type for {}: {}",
                    self.device_id, other
                );
                return None;
            }
        };
        let parsed = entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping malformed preset {} for {}: {}", entry, self.device_id, e);
                    None
                }
            })
            .collect();
        Some(parsed)
    }

    fn set(&mut self, capability: Capability, value: CapabilityValue) {
        self.updates.push(CapabilityUpdate::Set(capability, value));
    }

    fn thermostat_states(&mut self, entries: Vec<ThermostatStateEntry>) {
        for entry in entries {
            self.state.temperature_states.insert(entry.id, entry.temp_value);
        }
    }

    fn power_usage(&mut self, power: PowerUsage) {
        if let Some(watts) = power.value {
            self.set(Capability::MeasurePower, CapabilityValue::Number(watts));
        }
        if let (Some(high), Some(low)) = (power.day_usage, power.day_low_usage) {
            self.set(
                Capability::MeterPower,
                CapabilityValue::Number(wh_to_kwh(high + low)),
            );
        }
        self.state.power_usage = Some(power);
    }

    fn gas_usage(&mut self, gas: GasUsage) {
        if let Some(day) = gas.day_usage {
            self.set(Capability::MeterGas, CapabilityValue::Number(wh_to_kwh(day)));
        }
        self.state.gas_usage = Some(gas);
    }

    fn thermostat_info(&mut self, info: ThermostatInfo, capabilities: &CapabilityStore) {
        if let Some(display) = info.current_display_temp {
            self.set(
                Capability::MeasureTemperature,
                CapabilityValue::Number(hundredths_to_celsius(display)),
            );
        }
        if let Some(setpoint) = info.current_setpoint {
            self.set(
                Capability::TargetTemperature,
                CapabilityValue::Number(hundredths_to_celsius(setpoint)),
            );
        }
        if let Some(active) = info.active_state {
            let preset = match TemperatureState::from_id(active) {
                Some(preset) => CapabilityValue::Text(preset.as_str().to_string()),
                None => {
                    debug!("Unmapped activeState {} on {}", active, self.device_id);
                    CapabilityValue::Unset
                }
            };
            self.set(Capability::TemperatureState, preset);
        }
        if let Some(humidity) = info.current_humidity {
            if !capabilities.has(Capability::MeasureHumidity) {
                self.updates
                    .push(CapabilityUpdate::Add(Capability::MeasureHumidity));
            }
            self.set(Capability::MeasureHumidity, CapabilityValue::Number(humidity));
        }

        self.state.thermostat_info = Some(info);
    }
}

/// Hundredths of a degree to °C, rounded to one decimal.
pub fn hundredths_to_celsius(raw: i64) -> f64 {
    (raw as f64 / 10.0).round() / 10.0
}

fn wh_to_kwh(wh: f64) -> f64 {
    // Round away float noise such as 0.8000000000000002.
    (wh / 1000.0 * 1_000_000.0).round() / 1_000_000.0
}
