use thiserror::Error;
use toon_api::ApiError;

/// Errors from keeping the webhook subscription alive
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Another registration for this device is still in flight
    #[error("Subscription registration already in progress")]
    AlreadyRegistering,

    /// Every attempt failed
    #[error("Subscription failed after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    /// The device has no API client
    #[error("Device is not bound to a session")]
    NotBound,

    /// The subscription was torn down while registering
    #[error("Subscription was torn down")]
    TornDown,
}

/// Errors that can occur on a device
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// The provider rejected a thermostat write
    #[error("Failed to update thermostat: {0}")]
    Write(String),

    /// No thermostat object has been received yet, so there is nothing to merge into
    #[error("No thermostat state received yet")]
    NoBaseline,

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    #[error("Device is not bound to a session")]
    NotBound,

    /// The agreement is not visible to the session the device was moved to
    #[error("Agreement {0} not found for this account")]
    AgreementNotFound(String),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// The coalesced write was dropped before it ran
    #[error("Write was cancelled")]
    Cancelled,
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;
