//! Proxy service management and forwarding

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};

use super::{api_error, ApiError};
use crate::error::RegistrationError;
use crate::models::{RegisterServiceForm, StatusResponse};
use crate::proxy::ServiceSpec;
use crate::server::{request_host, AppState};

/// `GET /api/proxy/`
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceSpec>> {
    Json(state.services.list())
}

/// `POST /api/proxy/{host}`
pub async fn register(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
    Form(form): Form<RegisterServiceForm>,
) -> Result<Json<StatusResponse>, ApiError> {
    let host = state.services.expand_host(&host).map_err(registration_error)?;

    state
        .services
        .register(ServiceSpec {
            host,
            agent_name: form.agent_name,
            agent_id: form.agent_id,
            target: form.target,
            replace_host: form.replace_host,
        })
        .map_err(registration_error)?;

    Ok(Json(StatusResponse::ok()))
}

/// `DELETE /api/proxy/{host}`
pub async fn kill(
    State(state): State<Arc<AppState>>,
    Path(host): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let host = state.services.expand_host(&host).map_err(registration_error)?;
    state.services.kill(&host).map_err(registration_error)?;
    Ok(Json(StatusResponse::ok()))
}

fn registration_error(error: RegistrationError) -> ApiError {
    let status = match error {
        RegistrationError::InvalidHost => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, error.to_string())
}

/// Fallback: requests for a registered host go to its service
pub async fn forward(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let service = request_host(&request).and_then(|host| state.services.get(host));
    match service {
        Some(service) => service.handle(request).await,
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain")],
            "host not found",
        )
            .into_response(),
    }
}
