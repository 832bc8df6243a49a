//! Wire models for the Toon API.
//!
//! Numeric thermostat values travel as integers in hundredths of a degree
//! (`2150` is 21.5 °C). Unknown fields are preserved through `extra` so a
//! status object can be echoed back to the write endpoint unchanged.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event categories every webhook subscribes to.
pub const WEBHOOK_ACTIONS: [&str; 3] = ["Thermostat", "PowerUsage", "GasUsage"];

/// One installation paired with the authenticated account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agreement {
    pub agreement_id: String,
    #[serde(default)]
    pub display_common_name: String,
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub house_number: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
}

impl Agreement {
    /// Single-line address suitable for a pairing list.
    pub fn address(&self) -> String {
        format!(
            "{} {}, {} {}",
            self.street, self.house_number, self.postal_code, self.city
        )
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string()
    }
}

/// Program mode of the thermostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramState {
    /// Program disabled, setpoint held indefinitely
    Manual,
    /// Program enabled
    Program,
    /// Temporary override, program resumes at the next switch point
    Override,
}

impl ProgramState {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Manual => 0,
            Self::Program => 1,
            Self::Override => 2,
        }
    }
}

/// Full thermostat object as returned in a status payload.
///
/// This is the baseline for every write: the thermostat endpoint expects a
/// complete object, so callers merge their change into the last one received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermostatInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_setpoint: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_display_temp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_state: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_state: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_humidity: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ThermostatInfo {
    pub fn with_setpoint(mut self, setpoint: i64) -> Self {
        self.current_setpoint = Some(setpoint);
        self
    }

    pub fn with_program_state(mut self, state: ProgramState) -> Self {
        self.program_state = Some(state.as_i64());
        self
    }

    pub fn with_active_state(mut self, state: i64) -> Self {
        self.active_state = Some(state);
        self
    }
}

/// Electricity figures. Energy values are watt-hours, `value` is watts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerUsage {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub day_usage: Option<f64>,
    #[serde(default)]
    pub day_low_usage: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Gas figures. `day_usage` is expressed in Wh-equivalent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasUsage {
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub day_usage: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One row of the preset table (`thermostatStates.state`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThermostatStateEntry {
    pub id: i64,
    pub temp_value: i64,
    #[serde(default)]
    pub dhw: Option<i64>,
}

/// Envelope shared by webhook pushes and wrapped poll results.
///
/// A push without `updateDataSet` is a keep-alive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_data_set: Option<Value>,
}

impl StatusEnvelope {
    /// Wrap a polled status body so it goes through the same path as a push.
    pub fn from_poll(data: Value) -> Self {
        Self {
            common_name: None,
            time_to_live_seconds: None,
            update_data_set: Some(data),
        }
    }
}

/// Webhook registration as sent to and listed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub application_id: String,
    pub callback_url: String,
    #[serde(default)]
    pub subscribed_actions: Vec<String>,
}

impl Webhook {
    /// Registration for all categories the SDK consumes.
    pub fn new(application_id: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            callback_url: callback_url.into(),
            subscribed_actions: WEBHOOK_ACTIONS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Raw token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Persisted OAuth2 token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Build a token from an endpoint response received at `now`.
    ///
    /// A response without a refresh token keeps `previous_refresh`.
    pub fn from_response(
        response: TokenResponse,
        now: DateTime<Utc>,
        previous_refresh: Option<&str>,
    ) -> Self {
        let expires_in = response.expires_in.unwrap_or(3600);
        Self {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string))
                .unwrap_or_default(),
            expires_at: now + Duration::seconds(expires_in),
        }
    }

    /// Whether the token expires within `leeway` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        self.expires_at - leeway <= now
    }
}

/// Session metadata reported by the provider after authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
}
