//! Consul catalog lookup
//!
//! `GET /v1/catalog/service/{name}` returns one entry per registered node.
//! Each entry becomes `ServiceAddress:ServicePort`, or `Address:ServicePort`
//! when the service did not register its own address.

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{CatalogError, ServiceCatalog};

/// Catalog backed by a Consul agent's HTTP API
#[derive(Clone)]
pub struct ConsulCatalog {
    http: reqwest::Client,
    address: String,
}

/// The fields of a catalog entry we care about
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogService {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub service_address: String,
    #[serde(default)]
    pub service_port: u16,
}

impl CatalogService {
    pub fn host_port(&self) -> String {
        let host = if self.service_address.is_empty() {
            &self.address
        } else {
            &self.service_address
        };
        format!("{}:{}", host, self.service_port)
    }
}

impl ConsulCatalog {
    pub fn new(address: impl Into<String>, request_timeout: Duration) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("instance-registrar/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            address: address.into(),
        })
    }

    fn url(&self, service: &str) -> String {
        format!(
            "{}/v1/catalog/service/{}",
            self.address.trim_end_matches('/'),
            urlencoding::encode(service)
        )
    }
}

#[async_trait::async_trait]
impl ServiceCatalog for ConsulCatalog {
    async fn service_addresses(&self, service: &str) -> Result<Vec<String>, CatalogError> {
        let url = self.url(service);
        debug!(%url, "Consul catalog lookup");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }

        let entries: Vec<CatalogService> = response.json().await?;
        Ok(entries.iter().map(CatalogService::host_port).collect())
    }
}
