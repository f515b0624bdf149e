//! HTTP handlers
//!
//! - [`agent`]: notify streams and session transports dialed by agents
//! - [`client`]: instance listing, exec, pty and upgrade for API clients
//! - [`proxy`]: proxy service management and host-based forwarding

pub mod agent;
pub mod client;
pub mod proxy;

use axum::{http::StatusCode, Json};

use crate::models::ErrorResponse;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(message)))
}
