//! Hub configuration.
//!
//! [`HubConfig::default`] points at the production provider and leaves the
//! client registration empty; [`HubConfig::from_env`] fills it from `TOON_*`
//! variables. Either way the result must pass [`HubConfig::validate`]
//! before a hub is built from it.

use std::path::PathBuf;
use std::time::Duration;

use toon_api::oauth::{DEFAULT_AUTHORIZE_URL, DEFAULT_TOKEN_URL};
use toon_api::{OAuthConfig, DEFAULT_API_BASE_URL, DEFAULT_TENANT_ID};
use url::Url;

use crate::error::{HubError, Result};

/// Application id the webhooks are registered under by default.
pub const DEFAULT_APPLICATION_ID: &str = "toon-sdk";

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// OAuth2 client id
    pub client_id: String,
    pub client_secret: String,
    /// Default: `eneco`
    pub tenant_id: String,
    /// Redirect URI registered with the provider. When unset the callback
    /// server's own `/oauth/callback` URL is used.
    pub redirect_uri: Option<String>,

    pub api_base_url: String,
    pub authorize_url: String,
    pub token_url: String,

    /// Identifier of this installation in the session store
    /// Default: `default`
    pub config_id: String,
    /// Default: `toon-sdk`
    pub application_id: String,

    /// Externally reachable base URL for webhook pushes. When unset the
    /// callback server's LAN address is advertised.
    pub public_webhook_url: Option<Url>,
    /// Default: (3500, 3600)
    pub callback_port_range: (u16, u16),

    /// Default: 5 minutes
    pub poll_interval: Duration,
    /// Default: 500ms
    pub write_debounce: Duration,
    /// Default: 10
    pub subscription_retries: u32,
    /// Default: 6 seconds, doubled per attempt
    pub subscription_base_delay: Duration,

    /// Default: `<data dir>/toon-sdk/sessions.json`
    pub session_store_path: PathBuf,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            redirect_uri: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            config_id: "default".to_string(),
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            public_webhook_url: None,
            callback_port_range: (3500, 3600),
            poll_interval: Duration::from_secs(300),
            write_debounce: Duration::from_millis(500),
            subscription_retries: 10,
            subscription_base_delay: Duration::from_secs(6),
            session_store_path: default_store_path(),
        }
    }
}

impl HubConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            ..Default::default()
        }
    }

    /// Read the configuration from the process environment.
    ///
    /// | Variable                 | Field                    |
    /// |--------------------------|--------------------------|
    /// | `TOON_CLIENT_ID`         | `client_id`              |
    /// | `TOON_CLIENT_SECRET`     | `client_secret`          |
    /// | `TOON_TENANT_ID`         | `tenant_id`              |
    /// | `TOON_REDIRECT_URI`      | `redirect_uri`           |
    /// | `TOON_API_URL`           | `api_base_url`           |
    /// | `TOON_AUTHORIZE_URL`     | `authorize_url`          |
    /// | `TOON_TOKEN_URL`         | `token_url`              |
    /// | `TOON_CONFIG_ID`         | `config_id`              |
    /// | `TOON_APPLICATION_ID`    | `application_id`         |
    /// | `TOON_WEBHOOK_URL`       | `public_webhook_url`     |
    /// | `TOON_CALLBACK_PORTS`    | `callback_port_range`    |
    /// | `TOON_POLL_INTERVAL_SECS`| `poll_interval`          |
    /// | `TOON_SESSION_STORE`     | `session_store_path`     |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = var("TOON_CLIENT_ID") {
            config.client_id = v;
        }
        if let Some(v) = var("TOON_CLIENT_SECRET") {
            config.client_secret = v;
        }
        if let Some(v) = var("TOON_TENANT_ID") {
            config.tenant_id = v;
        }
        config.redirect_uri = var("TOON_REDIRECT_URI");
        if let Some(v) = var("TOON_API_URL") {
            config.api_base_url = v;
        }
        if let Some(v) = var("TOON_AUTHORIZE_URL") {
            config.authorize_url = v;
        }
        if let Some(v) = var("TOON_TOKEN_URL") {
            config.token_url = v;
        }
        if let Some(v) = var("TOON_CONFIG_ID") {
            config.config_id = v;
        }
        if let Some(v) = var("TOON_APPLICATION_ID") {
            config.application_id = v;
        }
        if let Some(v) = var("TOON_WEBHOOK_URL") {
            config.public_webhook_url = Some(parse_url("TOON_WEBHOOK_URL", &v)?);
        }
        if let Some(v) = var("TOON_CALLBACK_PORTS") {
            config.callback_port_range = parse_port_range(&v)?;
        }
        if let Some(v) = var("TOON_POLL_INTERVAL_SECS") {
            let secs: u64 = v.trim().parse().map_err(|_| {
                HubError::Config(format!("TOON_POLL_INTERVAL_SECS is not a number: {v}"))
            })?;
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(v) = var("TOON_SESSION_STORE") {
            config.session_store_path = PathBuf::from(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(HubError::Config("client id is empty".to_string()));
        }

        if self.callback_port_range.0 > self.callback_port_range.1 {
            return Err(HubError::Config(
                "Invalid callback port range: start must not exceed end".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(HubError::Config(
                "Poll interval must be greater than 0".to_string(),
            ));
        }

        if self.subscription_base_delay.is_zero() {
            return Err(HubError::Config(
                "Subscription retry delay must be greater than 0".to_string(),
            ));
        }

        if self.config_id.is_empty() || self.application_id.is_empty() {
            return Err(HubError::Config(
                "config id and application id must not be empty".to_string(),
            ));
        }

        if let Some(uri) = &self.redirect_uri {
            parse_url("redirect_uri", uri)?;
        }
        self.api_url()?;
        parse_url("authorize_url", &self.authorize_url)?;
        parse_url("token_url", &self.token_url)?;

        Ok(())
    }

    /// OAuth settings, using `fallback_redirect` when no redirect URI is
    /// configured.
    pub fn oauth_config(&self, fallback_redirect: &str) -> Result<OAuthConfig> {
        let redirect = self.redirect_uri.as_deref().unwrap_or(fallback_redirect);
        Ok(
            OAuthConfig::new(&self.client_id, &self.client_secret, redirect)?
                .with_tenant(Some(self.tenant_id.clone()))
                .with_endpoints(
                    parse_url("authorize_url", &self.authorize_url)?,
                    parse_url("token_url", &self.token_url)?,
                ),
        )
    }

    pub fn api_url(&self) -> Result<Url> {
        parse_url("api_base_url", &self.api_base_url)
    }

    /// Webhook URL for `device_id` under the public base, if one is set.
    pub fn public_webhook_for(&self, device_id: &str) -> Option<String> {
        self.public_webhook_url.as_ref().map(|base| {
            format!(
                "{}/webhook/{}",
                base.as_str().trim_end_matches('/'),
                device_id
            )
        })
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("toon-sdk")
        .join("sessions.json")
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| HubError::Config(format!("{name} is not a URL ({e}): {value}")))
}

/// `3500-3600`, or a single port.
fn parse_port_range(value: &str) -> Result<(u16, u16)> {
    let invalid = || HubError::Config(format!("TOON_CALLBACK_PORTS is not a port range: {value}"));
    let (start, end) = match value.split_once('-') {
        Some((start, end)) => (start, end),
        None => (value, value),
    };
    let start = start.trim().parse().map_err(|_| invalid())?;
    let end = end.trim().parse().map_err(|_| invalid())?;
    Ok((start, end))
}
