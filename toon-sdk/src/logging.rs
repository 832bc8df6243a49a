//! Logging setup for applications embedding the SDK.
//!
//! The SDK itself only emits `tracing` events. Installing a subscriber is
//! left to the application; these helpers cover the common cases.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber is installed
    Silent,
    /// Compact stderr output
    Development,
    /// Verbose output with source locations
    Debug,
    /// One JSON object per line, for log shippers
    Json,
}

impl LoggingMode {
    /// Parse a `TOON_LOG_MODE` value. Unknown values are `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "silent" => Some(Self::Silent),
            "development" | "dev" => Some(Self::Development),
            "debug" => Some(Self::Debug),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Install a global subscriber for `mode`.
///
/// # Environment Variables
///
/// - `TOON_LOG_LEVEL`: filter directives, e.g. `toon_device=debug,info`
/// - `RUST_LOG`: used when `TOON_LOG_LEVEL` is unset
///
/// # Example
///
/// ```rust,ignore
/// toon_sdk::logging::init_logging(LoggingMode::Development)?;
/// ```
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => Registry::default()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .compact(),
            )
            .with(create_env_filter("info")?)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(create_env_filter("debug")?)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(create_env_filter("info")?)
            .try_init()
            .map_err(|e| LoggingError::TracingInit(e.to_string())),
    }
}

/// Install a subscriber chosen by `TOON_LOG_MODE`.
///
/// Unset means silent. An unrecognised value is an error rather than a
/// silent fallback, so a typo does not hide all output.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var("TOON_LOG_MODE") {
        Ok(value) => LoggingMode::parse(&value)
            .ok_or_else(|| LoggingError::InvalidEnv(format!("TOON_LOG_MODE={value}")))?,
        Err(_) => LoggingMode::Silent,
    };

    init_logging(mode)
}

fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var("TOON_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives)
        .map_err(|e| LoggingError::InvalidEnv(format!("log filter {directives:?}: {e}")))
}

/// Whether a global subscriber is already installed.
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(LoggingMode::parse("Debug"), Some(LoggingMode::Debug));
        assert_eq!(LoggingMode::parse(" dev "), Some(LoggingMode::Development));
        assert_eq!(LoggingMode::parse("json"), Some(LoggingMode::Json));
        assert_eq!(LoggingMode::parse("verbose"), None);
    }
}
