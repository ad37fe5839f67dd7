//! Remote tool gateway source.
//!
//! The gateway is a single authenticated MCP endpoint. Listing its tools
//! means exchanging machine credentials for a short-lived bearer token
//! (OAuth2 `client_credentials` grant against the configured identity
//! provider), attaching it to a streamable-HTTP transport, and querying
//! `tools/list` once. Nothing here is cached across aggregation calls;
//! tokens expire, so every call re-authenticates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{Result, RuntimeError};
use crate::mcp::{HttpTransport, McpClient, McpToolAdapter};
use crate::tool::Tool;

/// Supplies scoped access tokens on demand.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self, provider_name: &str, scope: Option<&str>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 machine-to-machine credentials flow against a token endpoint.
pub struct OAuthClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthClientCredentials {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| RuntimeError::Gateway(format!("http client error: {err}")))?,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    /// Build from config when the exchange is fully specified.
    pub fn from_config(config: &GatewayConfig) -> Option<Result<Self>> {
        let token_url = config.token_url.clone()?;
        let client_id = config.client_id.clone()?;
        let client_secret = config.client_secret.clone()?;
        Some(Self::new(
            token_url,
            client_id,
            client_secret,
            Duration::from_secs(config.exchange_timeout_secs),
        ))
    }
}

#[async_trait]
impl CredentialProvider for OAuthClientCredentials {
    async fn access_token(&self, provider_name: &str, scope: Option<&str>) -> Result<String> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                RuntimeError::Gateway(format!(
                    "token exchange with `{provider_name}` failed: {err}"
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Gateway(format!(
                "token exchange with `{provider_name}` returned {status}: {body}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|err| {
            RuntimeError::Gateway(format!("failed to parse token response: {err}"))
        })?;

        debug!(
            provider = provider_name,
            expires_in = token.expires_in,
            "exchanged machine credentials for gateway token"
        );
        Ok(token.access_token)
    }
}

type GatewayClient = Arc<Mutex<McpClient<HttpTransport>>>;

/// The gateway adapter: contributes zero or more tools per aggregation call,
/// never failing past its own boundary.
pub struct GatewaySource {
    config: GatewayConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
    /// Most recently built client, kept for reuse within the same request.
    /// Rebuilt on the next aggregation call; never trusted across sessions.
    client: Mutex<Option<GatewayClient>>,
}

impl GatewaySource {
    pub fn new(config: GatewayConfig) -> Self {
        let credentials = match OAuthClientCredentials::from_config(&config) {
            Some(Ok(provider)) => Some(Arc::new(provider) as Arc<dyn CredentialProvider>),
            Some(Err(err)) => {
                warn!(%err, "gateway credential provider misconfigured");
                None
            }
            None => None,
        };
        Self {
            config,
            credentials,
            client: Mutex::new(None),
        }
    }

    pub fn with_credentials(config: GatewayConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            credentials: Some(credentials),
            client: Mutex::new(None),
        }
    }

    /// Fetch the gateway tool list. Every failure is logged and degrades to
    /// an empty contribution; the caller cannot tell a misconfigured gateway
    /// from an unreachable one, by design.
    pub async fn load_tools(&self) -> Vec<Arc<dyn Tool>> {
        let Some(url) = self.config.url.clone() else {
            debug!("gateway URL not configured; skipping gateway tools");
            return Vec::new();
        };

        match self.fetch(&url).await {
            Ok(tools) => {
                info!(count = tools.len(), "loaded gateway tools");
                tools
            }
            Err(err) => {
                error!(%err, "failed to load gateway tools");
                Vec::new()
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<Arc<dyn Tool>>> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| RuntimeError::Gateway("gateway credentials not configured".into()))?;

        let token = credentials
            .access_token(&self.config.provider_name, self.config.scope.as_deref())
            .await?;

        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        let transport = HttpTransport::with_headers(url, headers)?;
        let client = Arc::new(Mutex::new(
            McpClient::new(transport)
                .with_timeout(Duration::from_secs(self.config.exchange_timeout_secs)),
        ));

        let definitions = client.lock().await.list_tools().await?;
        *self.client.lock().await = Some(client.clone());

        Ok(definitions
            .into_iter()
            .map(|definition| {
                Arc::new(McpToolAdapter::new(definition, client.clone())) as Arc<dyn Tool>
            })
            .collect())
    }
}
