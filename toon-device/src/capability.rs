//! Capability storage with change detection
//!
//! A device exposes a set of capabilities. Each one holds a single value and
//! a write only counts as a change when the value actually differs, so
//! repeated identical payloads produce no events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::DeviceError;

/// Capabilities a thermostat can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Room temperature, °C
    MeasureTemperature,
    /// Setpoint, °C
    TargetTemperature,
    /// Active preset name
    TemperatureState,
    /// Relative humidity, %
    MeasureHumidity,
    /// Instantaneous electricity use, W
    MeasurePower,
    /// Electricity used today, kWh
    MeterPower,
    /// Gas used today, kWh
    MeterGas,
}

impl Capability {
    /// Capabilities every thermostat starts with. Humidity is added once the
    /// thermostat reports it.
    pub const DEFAULTS: [Capability; 6] = [
        Self::MeasureTemperature,
        Self::TargetTemperature,
        Self::TemperatureState,
        Self::MeasurePower,
        Self::MeterPower,
        Self::MeterGas,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::MeasureTemperature => "measure_temperature",
            Self::TargetTemperature => "target_temperature",
            Self::TemperatureState => "temperature_state",
            Self::MeasureHumidity => "measure_humidity",
            Self::MeasurePower => "measure_power",
            Self::MeterPower => "meter_power",
            Self::MeterGas => "meter_gas",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Capability {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::MeasureHumidity]
            .into_iter()
            .chain(Self::DEFAULTS)
            .find(|c| c.key() == s)
            .ok_or_else(|| DeviceError::UnknownCapability(s.to_string()))
    }
}

/// Value of a capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Number(f64),
    Text(String),
    /// Known capability without a value
    Unset,
}

impl CapabilityValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Capability values of one device.
///
/// # Example
///
/// ```rust
/// use toon_device::{Capability, CapabilityStore, CapabilityValue};
///
/// let mut store = CapabilityStore::with_defaults();
/// assert!(store.set(Capability::MeterGas, CapabilityValue::Number(1.0)).unwrap());
/// // Same value again is not a change
/// assert!(!store.set(Capability::MeterGas, CapabilityValue::Number(1.0)).unwrap());
/// // Humidity must be added first
/// assert!(store.set(Capability::MeasureHumidity, CapabilityValue::Number(40.0)).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityStore {
    values: BTreeMap<Capability, CapabilityValue>,
}

impl CapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        for capability in Capability::DEFAULTS {
            store.add(capability);
        }
        store
    }

    /// Expose a capability. Returns `false` if it was already exposed.
    pub fn add(&mut self, capability: Capability) -> bool {
        if self.values.contains_key(&capability) {
            return false;
        }
        self.values.insert(capability, CapabilityValue::Unset);
        true
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.values.contains_key(&capability)
    }

    pub fn get(&self, capability: Capability) -> Option<&CapabilityValue> {
        self.values.get(&capability)
    }

    /// Set a value, returning whether it changed.
    pub fn set(
        &mut self,
        capability: Capability,
        value: CapabilityValue,
    ) -> Result<bool, DeviceError> {
        let slot = self
            .values
            .get_mut(&capability)
            .ok_or_else(|| DeviceError::UnknownCapability(capability.key().to_string()))?;

        if *slot == value {
            return Ok(false);
        }
        *slot = value;
        Ok(true)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_exclude_humidity() {
        let store = CapabilityStore::with_defaults();
        assert_eq!(store.len(), 6);
        assert!(!store.has(Capability::MeasureHumidity));
        assert_eq!(
            store.get(Capability::MeterPower),
            Some(&CapabilityValue::Unset)
        );
    }

    #[test]
    fn test_set_reports_changes() {
        let mut store = CapabilityStore::with_defaults();
        let v = || CapabilityValue::Number(21.5);

        assert!(store.set(Capability::TargetTemperature, v()).unwrap());
        assert!(!store.set(Capability::TargetTemperature, v()).unwrap());
        assert!(store
            .set(Capability::TargetTemperature, CapabilityValue::Unset)
            .unwrap());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut store = CapabilityStore::new();
        assert!(store.add(Capability::MeasureHumidity));
        assert!(!store.add(Capability::MeasureHumidity));
        assert!(store
            .set(Capability::MeasureHumidity, CapabilityValue::Number(45.0))
            .unwrap());
    }

    #[test]
    fn test_unknown_capability() {
        let mut store = CapabilityStore::new();
        let err = store
            .set(Capability::MeterGas, CapabilityValue::Number(1.0))
            .unwrap_err();
        assert_eq!(err, DeviceError::UnknownCapability("meter_gas".into()));
    }

    #[test]
    fn test_parse_key() {
        assert_eq!(
            "measure_humidity".parse::<Capability>().unwrap(),
            Capability::MeasureHumidity
        );
        assert!("onoff".parse::<Capability>().is_err());
    }
}
