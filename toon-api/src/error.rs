use thiserror::Error;

/// Errors returned by the Toon API and OAuth2 provider.
///
/// Variants carry rendered messages rather than source errors so they can be
/// cloned and handed to every caller of a coalesced request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Connection, timeout or other transport-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The response body could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// Token exchange, refresh or session lookup failed
    #[error("Authorization error: {0}")]
    Auth(String),

    /// A URL or credential in the configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ApiError {
    /// Whether the provider rejected the credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Http { status: 401, .. } | Self::Auth(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ApiError::Parse(error.to_string())
        } else if let Some(status) = error.status() {
            ApiError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            ApiError::Network(error.to_string())
        }
    }
}

impl From<url::ParseError> for ApiError {
    fn from(error: url::ParseError) -> Self {
        ApiError::InvalidConfig(format!("invalid URL: {error}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(error: serde_json::Error) -> Self {
        ApiError::Parse(error.to_string())
    }
}

/// Type alias for results that can return an ApiError
pub type Result<T> = std::result::Result<T, ApiError>;
