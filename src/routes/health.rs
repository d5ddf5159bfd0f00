//! Health check endpoint
//!
//! `GET /v1/sys/health` always answers 200 while the process is serving;
//! it does not probe Vault or Consul.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Handle liveness probe
pub fn health_check() -> Response<Full<Bytes>> {
    let body = serde_json::to_string(&HealthResponse { status: "success" })
        .unwrap_or_else(|_| r#"{"status":"success"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
