//! API key middleware for the client and proxy routes

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use tracing::debug;

use crate::models::ErrorResponse;
use crate::server::AppState;

const AUTHENTICATE_CHALLENGE: &str = "Bearer realm=\"outpost\"";

type AuthRejection = (
    StatusCode,
    [(header::HeaderName, &'static str); 1],
    Json<ErrorResponse>,
);

/// Reject requests not carrying the configured API key
///
/// An empty configured key lets everything through. The key is taken from
/// the first present of the `api_key` query parameter, the `X-API-Key`
/// header and the `Authorization` header (`Bearer ` prefix optional).
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthRejection> {
    let expected = state.config.api_key.as_str();
    if expected.is_empty() {
        return Ok(next.run(request).await);
    }

    let query_key = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(params)| params.get("api_key").cloned());
    let provided = query_key
        .filter(|key| !key.is_empty())
        .or_else(|| presented_key(request.headers()));

    match provided {
        Some(key) if key == expected => Ok(next.run(request).await),
        _ => {
            debug!("Rejected {} {}: bad api key", request.method(), request.uri().path());
            Err((
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, AUTHENTICATE_CHALLENGE)],
                Json(ErrorResponse::with_code("invalid api key", "UNAUTHORIZED")),
            ))
        }
    }
}

/// Key from `X-API-Key`, then `Authorization`
fn presented_key(headers: &HeaderMap) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(key) = header_value("x-api-key") {
        return Some(key.to_string());
    }
    header_value(header::AUTHORIZATION.as_str()).map(|value| {
        value
            .strip_prefix("Bearer ")
            .unwrap_or(value)
            .trim()
            .to_string()
    })
}
