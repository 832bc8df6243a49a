//! # toon-sdk
//!
//! Async SDK for Toon smart thermostats.
//!
//! [`ToonHub`] is the entry point. It runs a small HTTP server that receives
//! the provider's webhook pushes and OAuth redirects, owns the single
//! [`SessionManager`] of the installation, and keeps every paired
//! [`Device`] current.
//!
//! ```text
//!                      ┌──────────── ToonHub ─────────────┐
//!  provider ─push────▶ │ CallbackServer ─▶ Device ─▶ DeviceEvent
//!  provider ─redirect▶ │ CallbackServer ─▶ SessionManager │
//!                      │ poll (5 min)   ─▶ Device         │
//!                      └──────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use toon_sdk::{logging, HubConfig, ToonHub};
//!
//! logging::init_logging_from_env()?;
//! let hub = ToonHub::start(HubConfig::from_env()?).await?;
//!
//! for agreement in hub.pairing_candidates().await? {
//!     let device = hub.add_device(&agreement).await?;
//!     let mut events = device.subscribe();
//!     device.set_target_temperature(21.3).await?; // written as 2150
//! }
//! ```
//!
//! The building blocks are re-exported for applications that wire things
//! themselves.

pub mod config;
mod error;
mod hub;
pub mod logging;

pub use config::{HubConfig, DEFAULT_APPLICATION_ID};
pub use error::{HubError, Result};
pub use hub::{HubComponents, ToonHub};

pub use toon_api::{Agreement, ApiError, ThermostatApi};
pub use toon_device::{
    Availability, Capability, CapabilityValue, Device, DeviceError, DeviceEvent, PayloadKind,
    SubscriptionState, SubscriptionStatus, TemperatureState,
};
pub use toon_session::{
    JsonFileStore, LoginOutcome, MemorySessionStore, SessionError, SessionEvent, SessionManager,
    SessionState, SessionStore,
};
