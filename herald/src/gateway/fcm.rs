use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::GatewayConfig;
use crate::dispatch::{BatchResponse, DeliveryGateway, MulticastMessage};

const MESSAGING_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_ENDPOINT: &str = "https://fcm.googleapis.com";

/// Access tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The subset of a Google service-account key file used for messaging.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid service-account key")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| {
            format!("failed to read credentials file {}", path.display())
        })?;
        Self::from_json(&raw)
            .with_context(|| format!("failed to load {}", path.display()))
    }
}

/// Claims of the signed assertion exchanged for an access token.
#[derive(Debug, Serialize, PartialEq)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl<'a> GrantClaims<'a> {
    fn new(key: &'a ServiceAccountKey, issued_at: i64) -> Self {
        Self {
            iss: &key.client_email,
            scope: MESSAGING_SCOPE,
            aud: &key.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Clone, Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Firebase Cloud Messaging over the HTTP v1 API.
///
/// A multicast is sent as one request per token, issued concurrently up to
/// `max_concurrent_sends`; per-token results are tallied into a single
/// [`BatchResponse`]. Only failing to obtain an access token fails the call
/// as a whole.
pub struct FcmGateway {
    client: reqwest::Client,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    project_id: String,
    endpoint: String,
    max_concurrent_sends: usize,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for FcmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FcmGateway")
            .field("project_id", &self.project_id)
            .field("client_email", &self.key.client_email)
            .field("max_concurrent_sends", &self.max_concurrent_sends)
            .finish_non_exhaustive()
    }
}

impl FcmGateway {
    pub fn new(
        key: ServiceAccountKey,
        config: &GatewayConfig,
    ) -> anyhow::Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("service-account private key is not a valid RSA PEM")?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build HTTP client")?;
        let project_id = config
            .project_id
            .clone()
            .unwrap_or_else(|| key.project_id.clone());

        Ok(Self {
            client,
            key,
            signing_key,
            project_id,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_concurrent_sends: config.max_concurrent_sends.max(1),
            token: Mutex::new(None),
        })
    }

    /// Load the credentials file named in `config` and build a gateway.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let key = ServiceAccountKey::from_file(&config.credentials_file)?;
        Self::new(key, config)
    }

    /// Send to a different API base URL, such as a regional endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn send_url(&self) -> String {
        format!("{}/v1/projects/{}/messages:send", self.endpoint, self.project_id)
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let issued_at = chrono::Utc::now().timestamp();
        let claims = GrantClaims::new(&self.key, issued_at);
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let assertion = jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .context("failed to sign token request")?;

        let response: TokenResponse = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .context("token request failed")?
            .error_for_status()
            .context("token request rejected")?
            .json()
            .await
            .context("invalid token response")?;

        let lifetime = Duration::from_secs(
            response.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS as u64),
        );
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_SKEW);
        tracing::debug!(expires_in_secs = lifetime.as_secs(), "fcm access token refreshed");

        *cached = Some(CachedToken {
            value: response.access_token.clone(),
            refresh_at,
        });
        Ok(response.access_token)
    }

    async fn send_one(
        &self,
        url: &str,
        access_token: &str,
        token: &str,
        message: &MulticastMessage,
    ) -> bool {
        let result = self
            .client
            .post(url)
            .bearer_auth(access_token)
            .json(&message_body(token, message))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match result {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(
                    status = err.status().map(|s| s.as_u16()),
                    "fcm send failed: {err}"
                );
                false
            }
        }
    }
}

/// Request body for a single-device HTTP v1 send.
fn message_body(token: &str, message: &MulticastMessage) -> serde_json::Value {
    json!({
        "message": {
            "token": token,
            "notification": {
                "title": message.title,
                "body": message.body,
            },
            "data": message.data,
        }
    })
}

#[async_trait]
impl DeliveryGateway for FcmGateway {
    async fn send_multicast(
        &self,
        message: &MulticastMessage,
    ) -> anyhow::Result<BatchResponse> {
        let access_token = self.access_token().await?;
        let url = self.send_url();

        let sends: Vec<_> = message
            .tokens
            .iter()
            .map(|token| self.send_one(&url, &access_token, token, message))
            .collect();
        let results: Vec<bool> = stream::iter(sends)
            .buffer_unordered(self.max_concurrent_sends)
            .collect()
            .await;

        let success_count = results.iter().filter(|ok| **ok).count();
        Ok(BatchResponse::new(
            success_count,
            results.len() - success_count,
        ))
    }
}
