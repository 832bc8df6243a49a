//! OAuth2 authorization-code flow against the Toon identity provider.
//!
//! The provider is strict about two details:
//!
//! - the `redirect_uri` must match the registered value exactly; a trailing
//!   slash variant is rejected, so it is stripped when the config is built
//! - both the authorization URL and the token request must name the tenant
//!   and the issuer, otherwise the request is refused

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use url::Url;

use crate::client::{normalize_base, DEFAULT_API_BASE_URL};
use crate::error::{ApiError, Result};
use crate::models::{Agreement, SessionInfo, Token, TokenResponse};

/// Tenant used when none is configured.
pub const DEFAULT_TENANT_ID: &str = "eneco";

/// Issuer marker required by the identity provider.
pub const ISSUER: &str = "identity.toon.eu";

pub const DEFAULT_AUTHORIZE_URL: &str = "https://api.toon.eu/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://api.toon.eu/token";
pub const DEFAULT_SCOPE: &str = "toon";

/// Client registration and provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub tenant_id: String,
    pub scope: String,
    pub authorize_url: Url,
    pub token_url: Url,
}

impl OAuthConfig {
    /// Build a config for the production provider.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Result<Self> {
        let client_id = client_id.into();
        if client_id.is_empty() {
            return Err(ApiError::InvalidConfig("client id is empty".to_string()));
        }

        let redirect_uri = redirect_uri.into().trim_end_matches('/').to_string();
        Url::parse(&redirect_uri)?;

        Ok(Self {
            client_id,
            client_secret: client_secret.into(),
            redirect_uri,
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
            authorize_url: Url::parse(DEFAULT_AUTHORIZE_URL)?,
            token_url: Url::parse(DEFAULT_TOKEN_URL)?,
        })
    }

    /// Override the tenant; `None` or an empty value keeps the default.
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        if let Some(tenant_id) = tenant_id.filter(|t| !t.is_empty()) {
            self.tenant_id = tenant_id;
        }
        self
    }

    pub fn with_endpoints(mut self, authorize_url: Url, token_url: Url) -> Self {
        self.authorize_url = authorize_url;
        self.token_url = token_url;
        self
    }

    /// Authorization URL for the given `state`.
    pub fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("state", state)
            .append_pair("tenant_id", &self.tenant_id)
            .append_pair("client_id", &self.client_id)
            .append_pair("issuer", ISSUER)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scope)
            .append_pair("redirect_uri", &self.redirect_uri);
        url
    }

    /// Form body of the authorization-code exchange.
    pub fn code_exchange_form(&self, code: &str) -> Vec<(&'static str, String)> {
        vec![
            ("grant_type", "authorization_code".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("code", code.to_string()),
            ("tenant_id", self.tenant_id.clone()),
        ]
    }

    /// Form body of a refresh-token grant.
    pub fn refresh_form(&self, refresh_token: &str) -> Vec<(&'static str, String)> {
        vec![
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("refresh_token", refresh_token.to_string()),
            ("tenant_id", self.tenant_id.clone()),
        ]
    }
}

/// The provider side of the authorization handshake.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// URL the user must visit to grant access.
    fn authorization_url(&self, state: &str) -> Url;

    /// Exchange an authorization code for a token.
    async fn exchange_code(&self, code: &str) -> Result<Token>;

    /// Obtain a fresh access token.
    async fn refresh(&self, refresh_token: &str) -> Result<Token>;

    /// Identify the account behind `token`.
    async fn session_info(&self, token: &Token) -> Result<SessionInfo>;
}

/// HTTP implementation of [`AuthProvider`].
#[derive(Debug, Clone)]
pub struct ToonOAuth {
    http: reqwest::Client,
    config: OAuthConfig,
    api_base_url: Url,
}

impl ToonOAuth {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        Ok(Self::with_api_base(config, Url::parse(DEFAULT_API_BASE_URL)?))
    }

    pub fn with_api_base(config: OAuthConfig, api_base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            api_base_url: normalize_base(api_base_url),
        }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    async fn token_request(
        &self,
        form: &[(&'static str, String)],
        previous_refresh: Option<&str>,
    ) -> Result<Token> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .header("issuer", ISSUER)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Token endpoint rejected request (HTTP {}): {}", status, body);
            return Err(ApiError::Auth(format!(
                "token request failed (HTTP {status}): {body}"
            )));
        }

        let body: TokenResponse = response.json().await?;
        Ok(Token::from_response(body, Utc::now(), previous_refresh))
    }
}

#[async_trait]
impl AuthProvider for ToonOAuth {
    fn authorization_url(&self, state: &str) -> Url {
        self.config.authorization_url(state)
    }

    async fn exchange_code(&self, code: &str) -> Result<Token> {
        debug!("Exchanging authorization code at {}", self.config.token_url);
        self.token_request(&self.config.code_exchange_form(code), None)
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token> {
        debug!("Refreshing access token");
        self.token_request(&self.config.refresh_form(refresh_token), Some(refresh_token))
            .await
    }

    /// The provider has no user-info endpoint; the first agreement of the
    /// account identifies the session.
    async fn session_info(&self, token: &Token) -> Result<SessionInfo> {
        let url = self.api_base_url.join("agreements")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(&token.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Auth(format!(
                "session lookup failed (HTTP {status})"
            )));
        }

        let agreements: Vec<Agreement> = response.json().await?;
        let first = agreements
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Auth("account has no agreements".to_string()))?;

        let title = if first.display_common_name.is_empty() {
            first.agreement_id.clone()
        } else {
            first.display_common_name
        };

        Ok(SessionInfo {
            id: first.agreement_id,
            title,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> OAuthConfig {
        OAuthConfig::new("client", "secret", "https://callback.example.com/oauth2/callback/")
            .unwrap()
    }

    #[test]
    fn test_redirect_uri_trailing_slash_is_stripped() {
        assert_eq!(
            config().redirect_uri,
            "https://callback.example.com/oauth2/callback"
        );
    }

    #[test]
    fn test_empty_client_id_is_rejected() {
        let result = OAuthConfig::new("", "secret", "https://callback.example.com/cb");
        assert!(matches!(result, Err(ApiError::InvalidConfig(_))));
    }

    #[test]
    fn test_authorization_url_carries_tenant_and_issuer() {
        let url = config().authorization_url("session-123");
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/authorize");
        assert_eq!(query["state"], "session-123");
        assert_eq!(query["tenant_id"], DEFAULT_TENANT_ID);
        assert_eq!(query["client_id"], "client");
        assert_eq!(query["issuer"], ISSUER);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["scope"], DEFAULT_SCOPE);
        assert_eq!(
            query["redirect_uri"],
            "https://callback.example.com/oauth2/callback"
        );
    }

    #[test]
    fn test_code_exchange_form() {
        let form: HashMap<_, _> = config()
            .with_tenant(Some("viesgo".to_string()))
            .code_exchange_form("the-code")
            .into_iter()
            .collect();

        assert_eq!(form["grant_type"], "authorization_code");
        assert_eq!(form["client_id"], "client");
        assert_eq!(form["client_secret"], "secret");
        assert_eq!(form["redirect_uri"], "https://callback.example.com/oauth2/callback");
        assert_eq!(form["code"], "the-code");
        assert_eq!(form["tenant_id"], "viesgo");
    }

    #[test]
    fn test_empty_tenant_keeps_default() {
        let config = config().with_tenant(Some(String::new()));
        assert_eq!(config.tenant_id, DEFAULT_TENANT_ID);
        let config = config.with_tenant(None);
        assert_eq!(config.tenant_id, DEFAULT_TENANT_ID);
    }
}
