//! Agreement-scoped REST client.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{ApiError, Result};
use crate::models::{Agreement, ThermostatInfo, Webhook};

/// Production API root.
pub const DEFAULT_API_BASE_URL: &str = "https://api.toon.eu/toon/v3/";

/// Supplies a valid bearer token for each request.
///
/// The session layer implements this so refreshes happen transparently and
/// the refreshed token is persisted.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, for scripts and tests.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Authenticated operations against the thermostat API.
///
/// Devices only ever talk to the provider through this trait, which lets a
/// device's client be swapped when the session changes.
#[async_trait]
pub trait ThermostatApi: Send + Sync {
    /// `GET agreements`
    async fn agreements(&self) -> Result<Vec<Agreement>>;

    /// `GET {agreementId}/status`, returned unparsed for the reconciler.
    async fn status(&self, agreement_id: &str) -> Result<Value>;

    /// `PUT {agreementId}/thermostat` with a complete thermostat object.
    async fn update_thermostat(&self, agreement_id: &str, info: &ThermostatInfo) -> Result<()>;

    /// `GET {agreementId}/webhooks`
    async fn webhooks(&self, agreement_id: &str) -> Result<Vec<Webhook>>;

    /// `POST {agreementId}/webhooks`
    async fn subscribe(&self, agreement_id: &str, webhook: &Webhook) -> Result<()>;

    /// `DELETE {agreementId}/webhooks/{applicationId}`
    async fn unsubscribe(&self, agreement_id: &str, application_id: &str) -> Result<()>;
}

/// Builds API clients bound to a token source.
pub trait ClientFactory: Send + Sync {
    fn create(&self, tokens: Arc<dyn TokenSource>) -> Arc<dyn ThermostatApi>;
}

/// reqwest-backed implementation of [`ThermostatApi`].
#[derive(Clone)]
pub struct ToonClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
}

impl ToonClient {
    pub fn new(base_url: Url, tokens: Arc<dyn TokenSource>) -> Self {
        Self::with_http_client(reqwest::Client::new(), base_url, tokens)
    }

    /// Share a connection pool between clients.
    pub fn with_http_client(
        http: reqwest::Client,
        base_url: Url,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            base_url: normalize_base(base_url),
            tokens,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.endpoint(path)?;
        let token = self.tokens.access_token().await?;
        debug!("{} {}", method, url);
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json"))
    }

    async fn send(request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(ApiError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

impl std::fmt::Debug for ToonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToonClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ThermostatApi for ToonClient {
    async fn agreements(&self) -> Result<Vec<Agreement>> {
        let request = self.request(Method::GET, "agreements").await?;
        Ok(Self::send(request).await?.json().await?)
    }

    async fn status(&self, agreement_id: &str) -> Result<Value> {
        let request = self
            .request(Method::GET, &format!("{agreement_id}/status"))
            .await?;
        Ok(Self::send(request).await?.json().await?)
    }

    async fn update_thermostat(&self, agreement_id: &str, info: &ThermostatInfo) -> Result<()> {
        let request = self
            .request(Method::PUT, &format!("{agreement_id}/thermostat"))
            .await?
            .json(info);
        Self::send(request).await?;
        Ok(())
    }

    async fn webhooks(&self, agreement_id: &str) -> Result<Vec<Webhook>> {
        let request = self
            .request(Method::GET, &format!("{agreement_id}/webhooks"))
            .await?;
        Ok(Self::send(request).await?.json().await?)
    }

    async fn subscribe(&self, agreement_id: &str, webhook: &Webhook) -> Result<()> {
        let request = self
            .request(Method::POST, &format!("{agreement_id}/webhooks"))
            .await?
            .json(webhook);
        Self::send(request).await?;
        Ok(())
    }

    async fn unsubscribe(&self, agreement_id: &str, application_id: &str) -> Result<()> {
        let request = self
            .request(
                Method::DELETE,
                &format!("{agreement_id}/webhooks/{application_id}"),
            )
            .await?;
        Self::send(request).await?;
        Ok(())
    }
}

/// Creates [`ToonClient`]s sharing one connection pool.
#[derive(Debug, Clone)]
pub struct ToonClientFactory {
    http: reqwest::Client,
    base_url: Url,
}

impl ToonClientFactory {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }
}

impl ClientFactory for ToonClientFactory {
    fn create(&self, tokens: Arc<dyn TokenSource>) -> Arc<dyn ThermostatApi> {
        Arc::new(ToonClient::with_http_client(
            self.http.clone(),
            self.base_url.clone(),
            tokens,
        ))
    }
}

/// `Url::join` drops the last segment unless the base ends with a slash.
pub(crate) fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_appends_slash() {
        let url = normalize_base(Url::parse("https://api.toon.eu/toon/v3").unwrap());
        assert_eq!(url.as_str(), "https://api.toon.eu/toon/v3/");
        assert_eq!(
            url.join("123/status").unwrap().as_str(),
            "https://api.toon.eu/toon/v3/123/status"
        );
    }

    #[tokio::test]
    async fn test_static_token() {
        let source = StaticToken::new("abc");
        assert_eq!(source.access_token().await.unwrap(), "abc");
    }
}
