//! Error types for the registrar service
//!
//! Each variant knows its HTTP status and the body that is safe to send back
//! to the caller. Backend detail never reaches the response body.

use hyper::StatusCode;

use crate::catalog::CatalogError;
use crate::registrar::RegistrationError;

/// Main error type for registrar operations
#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    /// Caller input rejected by the validator
    #[error("{0}")]
    Validation(String),

    /// Secret backend failure while issuing or wrapping credentials
    #[error("{0}")]
    Backend(String),

    /// Peer lookup failed
    #[error("{0}")]
    Catalog(String),

    /// Request body missing, oversized, or not JSON
    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RegistrarError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Catalog(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<RegistrationError> for RegistrarError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::Validation(e) => Self::Validation(e.to_string()),
            err @ RegistrationError::Backend => Self::Backend(err.to_string()),
        }
    }
}

impl From<CatalogError> for RegistrarError {
    fn from(_: CatalogError) -> Self {
        Self::Catalog("unable to retrieve consul servers".to_string())
    }
}

impl From<std::io::Error> for RegistrarError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
