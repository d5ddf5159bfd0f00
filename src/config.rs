//! Configuration for the registrar
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::DEFAULT_SERVICE;

/// Instance registrar - hands new instances a Vault token via cubbyhole
#[derive(Parser, Debug, Clone)]
#[command(name = "instance-registrar")]
#[command(about = "Registers new compute instances with Vault")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Port to accept requests on (overrides the port in LISTEN)
    #[arg(long = "port", env = "HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Address of the Vault server
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_addr: String,

    /// Auth token for this application
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub vault_token: String,

    /// Consul server addresses sent to clients so they can join the WAN pool
    #[arg(
        long = "consul-server-addr",
        env = "CONSUL_SERVER_ADDRS",
        value_delimiter = ','
    )]
    pub consul_server_addrs: Vec<String>,

    /// Consul HTTP address; when set, server addresses come from the catalog
    #[arg(long, env = "CONSUL_HTTP_ADDR")]
    pub consul_addr: Option<String>,

    /// Catalog service whose nodes are handed out as Consul servers
    #[arg(long, env = "CONSUL_SERVICE", default_value = DEFAULT_SERVICE)]
    pub consul_service: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable debug logging (same as LOG_LEVEL=debug)
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Path to JSON log file (logs go to stdout when unset)
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Timeout for outbound Vault and Consul requests in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,
}

impl Args {
    /// Socket address to bind, with HTTP_PORT applied
    pub fn listen_addr(&self) -> SocketAddr {
        match self.http_port {
            Some(port) => SocketAddr::new(self.listen.ip(), port),
            None => self.listen,
        }
    }

    /// Effective log level
    pub fn effective_log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(self.vault_addr.starts_with("http://") || self.vault_addr.starts_with("https://")) {
            return Err("VAULT_ADDR must be an http:// or https:// URL".to_string());
        }

        if self.vault_token.trim().is_empty() {
            return Err("VAULT_TOKEN must not be empty".to_string());
        }

        if self.consul_addr.is_none() && self.consul_server_addrs.is_empty() {
            return Err(
                "either CONSUL_SERVER_ADDRS or CONSUL_HTTP_ADDR must be provided".to_string(),
            );
        }

        if self.consul_service.is_empty() {
            return Err("CONSUL_SERVICE must not be empty".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        Ok(())
    }
}
