//! HTTP routes

pub mod health;
pub mod register;

pub use health::health_check;
pub use register::{
    error_response, handle_register_request, register_instance, remote_addr,
    RegisterInstanceBody, RegisterInstanceResponse,
};
