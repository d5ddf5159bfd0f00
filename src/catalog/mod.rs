//! Peer address lookup
//!
//! Registering instances are told which Consul servers to join. The list
//! either comes straight from configuration ([`StaticCatalog`]) or from a
//! Consul catalog query ([`ConsulCatalog`]). Neither caches nor retries.

pub mod consul;

use std::sync::Arc;

pub use consul::ConsulCatalog;

/// Service name looked up when no other is configured
pub const DEFAULT_SERVICE: &str = "consul-wan";

/// Errors from catalog lookups
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Catalog request failed: {0}")]
    Request(String),

    #[error("Catalog returned {0}")]
    Status(u16),

    #[error("Invalid catalog response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CatalogError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// Resolves a service name to `host:port` strings
#[async_trait::async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn service_addresses(&self, service: &str) -> Result<Vec<String>, CatalogError>;
}

/// Fixed list from configuration; ignores the service name
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    addresses: Arc<Vec<String>>,
}

impl StaticCatalog {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses: Arc::new(addresses),
        }
    }
}

#[async_trait::async_trait]
impl ServiceCatalog for StaticCatalog {
    async fn service_addresses(&self, _service: &str) -> Result<Vec<String>, CatalogError> {
        Ok(self.addresses.as_ref().clone())
    }
}
