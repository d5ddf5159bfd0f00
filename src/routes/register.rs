//! Instance registration endpoint
//!
//! POST /v1/register/instance
//!
//! ```json
//! {"environment": "dev", "provider": "aws", "account": "gen",
//!  "region": "us-east-1", "instance_id": "i-04c9c4c4",
//!  "role": "cluster-server", "policies": ["instance-management"]}
//! ```
//!
//! Success is 200 with `{temp_token, vault_endpoint, consul_servers}`.
//! Errors are plain text: 400 for bad input, 500 for Vault or Consul failures.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::HeaderMap;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{error, warn};

use crate::registrar::RegistrationRequest;
use crate::server::AppState;
use crate::types::RegistrarError;

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 10240;

/// JSON body of a registration request. Missing fields are empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterInstanceBody {
    pub environment: String,
    pub provider: String,
    pub account: String,
    pub region: String,
    pub instance_id: String,
    pub role: String,
    pub policies: Vec<String>,
}

impl RegisterInstanceBody {
    pub fn into_request(self, remote_addr: String) -> RegistrationRequest {
        RegistrationRequest {
            environment: self.environment,
            provider: self.provider,
            account: self.account,
            region: self.region,
            instance_id: self.instance_id,
            role: self.role,
            policies: self.policies,
            remote_addr,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterInstanceResponse<'a> {
    pub temp_token: &'a str,
    pub vault_endpoint: &'a str,
    pub consul_servers: Vec<String>,
}

/// Caller address: first `X-Forwarded-For` hop if present, else the peer IP
pub fn remote_addr(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Read the body and run the registration.
///
/// The body is read through a [`Limited`] wrapper, so at most
/// `MAX_BODY_BYTES` are ever buffered.
pub async fn handle_register_request<B>(
    state: &AppState,
    req: Request<B>,
    peer: SocketAddr,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let remote = remote_addr(req.headers(), peer);

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!(remote_ip = %remote, limit = MAX_BODY_BYTES, "Request body too large");
            return error_response(RegistrarError::BadRequest(
                "request body too large".to_string(),
            ));
        }
        Err(e) => {
            error!(remote_ip = %remote, "Unable to read body: {}", e);
            return error_response(RegistrarError::BadRequest(
                "unable to decode payload".to_string(),
            ));
        }
    };

    register_instance(state, &body, remote).await
}

/// Decode, look up Consul servers, and register.
///
/// Validation runs first so a rejected request touches neither Consul nor
/// Vault. The peer lookup runs before any token exists, so a catalog failure
/// cannot strand a minted token.
pub async fn register_instance(
    state: &AppState,
    body: &[u8],
    remote: String,
) -> Response<Full<Bytes>> {
    let payload: RegisterInstanceBody = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => {
            error!(remote_ip = %remote, "Unable to decode payload: {}", e);
            return error_response(RegistrarError::BadRequest(
                "unable to decode payload".to_string(),
            ));
        }
    };

    let request = payload.into_request(remote);
    if let Err(e) = request.validate() {
        warn!(remote_ip = %request.remote_addr, reason = %e, "Registration rejected");
        return error_response(RegistrarError::Validation(e.to_string()));
    }

    let consul_servers = match state.catalog.service_addresses(&state.consul_service).await {
        Ok(addrs) => addrs,
        Err(e) => {
            error!(
                remote_ip = %request.remote_addr,
                service = %state.consul_service,
                error = %e,
                "Unable to retrieve consul servers"
            );
            return error_response(e.into());
        }
    };

    let result = match state.registrar.register(&request).await {
        Ok(r) => r,
        Err(e) => return error_response(e.into()),
    };

    let response = RegisterInstanceResponse {
        temp_token: result.temp_token.expose(),
        vault_endpoint: state.registrar.vault_endpoint(),
        consul_servers,
    };

    match serde_json::to_vec(&response) {
        Ok(json) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .header("Cache-Control", "no-store")
            .body(Full::new(Bytes::from(json)))
            .unwrap(),
        Err(e) => {
            error!("Unable to marshal response body: {}", e);
            error_response(RegistrarError::Internal(
                "failed generating response body".to_string(),
            ))
        }
    }
}

/// Plain-text error response; the body is the error's public message
pub fn error_response(err: RegistrarError) -> Response<Full<Bytes>> {
    let (status, body) = err.into_status_code_and_body();
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
