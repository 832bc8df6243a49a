//! # toon-device
//!
//! One paired Toon thermostat and everything that keeps it current.
//!
//! ## Data flow
//!
//! ```text
//!   webhook push ─┐
//!                 ├─▶ Device::handle_payload ─▶ reconcile() ─▶ capabilities ─▶ DeviceEvent
//!   poll ─────────┘                                  │
//!                                                    └─ TTL ─▶ SubscriptionScheduler (renewal)
//!
//!   set_target_temperature ─▶ Debouncer (500ms) ─▶ PUT thermostat (merged into baseline)
//! ```
//!
//! - [`reconcile`] is a pure merge of a payload into [`DeviceState`]. It never
//!   fails; sections that do not parse are logged and skipped.
//! - [`SubscriptionScheduler`] registers the webhook with exponential
//!   backoff and re-registers whenever the server-declared TTL runs out.
//! - [`Device`] implements [`toon_session::ManagedDevice`], so the session
//!   manager can move it to a new API client after a re-login.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use task_queue::TokioClock;
//! use toon_device::{Device, DeviceConfig, SubscriptionConfig};
//!
//! let config = DeviceConfig::new(
//!     "eneco-001-123456",
//!     "12345",
//!     SubscriptionConfig::new("toon-sdk", "https://hub.example.com/webhook/eneco-001-123456"),
//! );
//! let device = Device::new(config, Arc::new(TokioClock));
//! device.attach(client);
//! device.register_subscription().await?;
//! device.set_target_temperature(21.3).await?; // writes 2150
//! ```

pub mod capability;
pub mod device;
pub mod error;
pub mod reconciler;
pub mod subscription;
pub mod temperature_state;

pub use capability::{Capability, CapabilityStore, CapabilityValue};
pub use device::{round_to_half, Availability, Device, DeviceConfig, DeviceEvent};
pub use error::{DeviceError, Result, SubscriptionError};
pub use reconciler::{
    hundredths_to_celsius, reconcile, CapabilityUpdate, DeviceState, PayloadKind,
    ReconcileContext, Reconciliation,
};
pub use subscription::{
    SubscriptionConfig, SubscriptionScheduler, SubscriptionState, SubscriptionStatus,
};
pub use temperature_state::TemperatureState;
