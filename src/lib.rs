//! Instance registrar - Vault token handoff for newly launched instances
//!
//! A freshly booted instance asks the registrar for credentials. The
//! registrar mints a long-lived token carrying the requested policies, stores
//! it in the cubbyhole of a short-lived, two-use token, and returns only the
//! short-lived one. The instance spends one use reading its permanent token
//! out of the cubbyhole; nobody else can.
//!
//! ## Services
//!
//! - **Registrar**: token minting and cubbyhole handoff
//! - **Vault**: HTTP client for the token and cubbyhole APIs
//! - **Catalog**: Consul server addresses returned alongside the token

pub mod catalog;
pub mod config;
pub mod logging;
pub mod registrar;
pub mod routes;
pub mod server;
pub mod types;
pub mod vault;

pub use config::Args;
pub use registrar::{Registrar, RegistrationRequest, RegistrationResult};
pub use server::{run, serve, AppState};
pub use types::RegistrarError;
