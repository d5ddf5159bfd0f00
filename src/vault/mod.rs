//! Vault client contract
//!
//! The registrar talks to Vault only through [`SecretBackend`], which covers
//! the handful of token and logical-write operations the handoff needs.
//! [`VaultClient`] is the HTTP implementation; tests supply their own.
//!
//! Wire shapes follow the Vault HTTP API:
//! - `POST /v1/auth/token/create` takes a [`TokenCreateRequest`]
//! - every response is a [`Secret`], with token details under `auth`

pub mod client;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use client::VaultClient;

// =============================================================================
// Client Token
// =============================================================================

/// A Vault client token.
///
/// Formatting never shows the value, so tokens can sit inside structs that
/// are logged with `?`. The buffer is zeroized when dropped. Serialization
/// writes the real value, which is what the cubbyhole payload needs.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop)]
pub struct ClientToken(String);

impl ClientToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the `X-Vault-Token` header and response bodies.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientToken([REDACTED])")
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for ClientToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ClientToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// Body of `POST /v1/auth/token/create`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenCreateRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    /// Empty means the token only gets Vault's implicit `default` policy
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<String>,
    #[serde(rename = "meta", skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(
        rename = "ttl",
        serialize_with = "serialize_ttl",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl: Option<Duration>,
    /// 0 = unlimited
    #[serde(skip_serializing_if = "is_zero")]
    pub num_uses: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub no_parent: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn serialize_ttl<S: Serializer>(ttl: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match ttl {
        Some(d) => serializer.serialize_str(&format_ttl(*d)),
        None => serializer.serialize_none(),
    }
}

/// Render a duration the way Vault expects it (`72h`, `15m`, `15s`)
pub fn format_ttl(ttl: Duration) -> String {
    let secs = ttl.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Generic Vault response envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub lease_id: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
    #[serde(default)]
    pub auth: Option<SecretAuth>,
}

impl Secret {
    /// Client token from the `auth` block, if this secret carries one
    pub fn client_token(&self) -> Option<&ClientToken> {
        self.auth
            .as_ref()
            .map(|auth| &auth.client_token)
            .filter(|token| !token.is_empty())
    }
}

/// Token details returned by auth endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretAuth {
    pub client_token: ClientToken,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from Vault calls
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Vault request failed: {0}")]
    Request(String),

    #[error("Vault returned {status}: {}", .errors.join("; "))]
    Status { status: u16, errors: Vec<String> },

    #[error("Invalid Vault response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Operations the registrar needs from Vault (allows mocking in tests)
#[async_trait::async_trait]
pub trait SecretBackend: Send + Sync {
    /// Externally reachable Vault address, handed to registering instances
    fn endpoint(&self) -> &str;

    /// A new client authenticated as `token`. The receiver is unchanged.
    fn with_token(&self, token: &ClientToken) -> Arc<dyn SecretBackend>;

    /// Mint a token as a child of (or, with `no_parent`, independent from) the
    /// client's own token
    async fn create_token(&self, request: &TokenCreateRequest) -> Result<Secret, VaultError>;

    /// Logical write. Vault answers many writes with 204, hence the `Option`.
    async fn write(&self, path: &str, data: &Value) -> Result<Option<Secret>, VaultError>;

    /// Revoke a token and its children
    async fn revoke_token(&self, token: &ClientToken) -> Result<(), VaultError>;
}
