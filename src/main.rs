//! Instance registrar - Vault token handoff for newly launched instances

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use instance_registrar::{config::Args, logging, server, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args)?;

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Instance Registrar v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Listen: {}", args.listen_addr());
    info!("Vault: {}", args.vault_addr);
    match &args.consul_addr {
        Some(addr) => info!("Consul catalog: {} (service {})", addr, args.consul_service),
        None => info!("Consul servers: {}", args.consul_server_addrs.join(", ")),
    }
    info!("Log level: {}", args.effective_log_level());
    info!("======================================");

    let state = Arc::new(AppState::from_args(&args)?);

    server::run(state, args.listen_addr()).await?;

    Ok(())
}
