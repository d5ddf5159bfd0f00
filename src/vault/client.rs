//! Vault HTTP client
//!
//! Thin wrapper over `reqwest` that speaks the subset of the Vault API the
//! registrar uses. Every request carries the client's token in
//! `X-Vault-Token`; error bodies (`{"errors": [...]}`) are surfaced in
//! [`VaultError::Status`] for logging.

use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ClientToken, Secret, SecretBackend, TokenCreateRequest, VaultError};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Vault client bound to one token
#[derive(Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    /// Address exactly as configured; also what instances are told to use
    address: String,
    token: ClientToken,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultClient {
    /// Create a client for `address` authenticated with `token`
    pub fn new(
        address: impl Into<String>,
        token: ClientToken,
        request_timeout: Duration,
    ) -> Result<Self, VaultError> {
        let address = address.into();
        let parsed = reqwest::Url::parse(&address)
            .map_err(|e| VaultError::Request(format!("invalid Vault address {}: {}", address, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(VaultError::Request(format!(
                "unsupported Vault address scheme: {}",
                parsed.scheme()
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("instance-registrar/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            address,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}",
            self.address.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn request(&self, method: Method, path: &str, body: &Value) -> Result<Response, VaultError> {
        let url = self.url(path);
        debug!(%method, %url, "Vault request");
        let response = self
            .http
            .request(method, url)
            .header(TOKEN_HEADER, self.token.expose())
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }
}

/// Turn non-2xx responses into [`VaultError::Status`]
async fn check_status(response: Response) -> Result<Response, VaultError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let errors = serde_json::from_str::<ErrorResponse>(&body)
        .map(|parsed| parsed.errors)
        .unwrap_or_else(|_| if body.is_empty() { Vec::new() } else { vec![body] });
    Err(VaultError::Status {
        status: status.as_u16(),
        errors,
    })
}

/// Decode a response body that may legitimately be empty (204)
async fn decode_optional(response: Response) -> Result<Option<Secret>, VaultError> {
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| VaultError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl SecretBackend for VaultClient {
    fn endpoint(&self) -> &str {
        &self.address
    }

    fn with_token(&self, token: &ClientToken) -> Arc<dyn SecretBackend> {
        // reqwest::Client is reference counted; the connection pool is shared
        Arc::new(Self {
            http: self.http.clone(),
            address: self.address.clone(),
            token: token.clone(),
        })
    }

    async fn create_token(&self, request: &TokenCreateRequest) -> Result<Secret, VaultError> {
        let body = serde_json::to_value(request).map_err(|e| VaultError::Decode(e.to_string()))?;
        let response = self.request(Method::POST, "auth/token/create", &body).await?;
        response
            .json::<Secret>()
            .await
            .map_err(|e| VaultError::Decode(e.to_string()))
    }

    async fn write(&self, path: &str, data: &Value) -> Result<Option<Secret>, VaultError> {
        let response = self.request(Method::POST, path, data).await?;
        decode_optional(response).await
    }

    async fn revoke_token(&self, token: &ClientToken) -> Result<(), VaultError> {
        let body = json!({ "token": token.expose() });
        self.request(Method::POST, "auth/token/revoke", &body).await?;
        Ok(())
    }
}
