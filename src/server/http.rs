//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::catalog::{ConsulCatalog, ServiceCatalog, StaticCatalog};
use crate::config::Args;
use crate::registrar::Registrar;
use crate::routes;
use crate::types::RegistrarError;
use crate::vault::{ClientToken, VaultClient};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub const REGISTER_INSTANCE_PATH: &str = "/v1/register/instance";
pub const HEALTH_PATH: &str = "/v1/sys/health";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registrar: Registrar,
    /// Source of the Consul server addresses handed to new instances
    pub catalog: Arc<dyn ServiceCatalog>,
    pub consul_service: String,
}

impl AppState {
    pub fn new(
        registrar: Registrar,
        catalog: Arc<dyn ServiceCatalog>,
        consul_service: impl Into<String>,
    ) -> Self {
        Self {
            registrar,
            catalog,
            consul_service: consul_service.into(),
        }
    }

    /// Build the Vault client and peer catalog from configuration
    pub fn from_args(args: &Args) -> Result<Self, RegistrarError> {
        let vault = VaultClient::new(
            args.vault_addr.clone(),
            ClientToken::new(args.vault_token.clone()),
            args.request_timeout(),
        )
        .map_err(|e| RegistrarError::Config(e.to_string()))?;

        let catalog: Arc<dyn ServiceCatalog> = match &args.consul_addr {
            Some(addr) => Arc::new(
                ConsulCatalog::new(addr.clone(), args.request_timeout())
                    .map_err(|e| RegistrarError::Config(e.to_string()))?,
            ),
            None => Arc::new(StaticCatalog::new(args.consul_server_addrs.clone())),
        };

        Ok(Self::new(
            Registrar::new(Arc::new(vault)),
            catalog,
            args.consul_service.clone(),
        ))
    }
}

/// Bind `listen` and serve until the process exits
pub async fn run(state: Arc<AppState>, listen: SocketAddr) -> Result<(), RegistrarError> {
    let listener = TcpListener::bind(listen).await?;
    info!("Registrar listening on {}", listen);
    serve(listener, state).await
}

/// Accept loop over an already-bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<(), RegistrarError> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::POST, REGISTER_INSTANCE_PATH) => {
            routes::handle_register_request(&state, req, addr).await
        }

        (Method::GET, HEALTH_PATH) => routes::health_check(),

        _ => not_found_response(&path),
    };

    Ok(to_boxed(response))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
