//! Operator HTTP API.
//!
//! Routes:
//! - `GET  /healthz`
//! - `GET  /v1/instances`
//! - `GET  /v1/instances/{name}`
//! - `POST /v1/instances/{name}/{action}` where action is one of
//!   `start`, `stop`, `remove`, `reconcile`, `pin`, `unpin`

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::FleetError;
use crate::fleet::FleetManager;
use crate::instance::InstanceSummary;

/// Error body returned by every failing route.
#[derive(Debug, Serialize)]
pub struct Problem {
    pub title: String,
    pub status: u16,
    pub code: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Problem,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            status,
            problem: Problem {
                title,
                status: status.as_u16(),
                code: code.into(),
                detail: detail.into(),
            },
        }
    }

    pub fn not_found(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn conflict(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, detail)
    }

    pub fn gateway_timeout(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, detail)
    }

    pub fn internal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, detail)
    }
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let detail = err.to_string();
        match err {
            FleetError::Timeout { .. } => ApiError::gateway_timeout(err.code(), detail),
            FleetError::Pinned(_) => ApiError::conflict(err.code(), detail),
            FleetError::NotFound(_) => ApiError::not_found(err.code(), detail),
            _ => ApiError::internal(err.code(), detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    items: Vec<InstanceSummary>,
}

/// Build the admin router over `fleet`.
pub fn router(fleet: Arc<FleetManager>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/instances", get(list_instances))
        .route("/v1/instances/{name}", get(get_instance))
        .route("/v1/instances/{name}/{action}", post(instance_action))
        .layer(TraceLayer::new_for_http())
        .with_state(fleet)
}

async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            service: "warden",
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// GET /v1/instances
async fn list_instances(State(fleet): State<Arc<FleetManager>>) -> Json<ListResponse> {
    Json(ListResponse {
        items: fleet.summaries().await,
    })
}

/// GET /v1/instances/{name}
async fn get_instance(
    State(fleet): State<Arc<FleetManager>>,
    Path(name): Path<String>,
) -> Result<Json<InstanceSummary>, ApiError> {
    Ok(Json(fleet.status(&name).await?))
}

/// POST /v1/instances/{name}/{action}
async fn instance_action(
    State(fleet): State<Arc<FleetManager>>,
    Path((name, action)): Path<(String, String)>,
) -> Result<Json<InstanceSummary>, ApiError> {
    info!(instance = %name, action = %action, "Operator command");
    match action.as_str() {
        "start" => fleet.start(&name).await?,
        "stop" => fleet.stop(&name).await?,
        "remove" => fleet.remove(&name).await?,
        "reconcile" => fleet.reconcile_instance(&name).await?,
        "pin" => fleet.pin(&name).await?,
        "unpin" => fleet.unpin(&name).await?,
        other => {
            return Err(ApiError::not_found(
                "unknown_action",
                format!("unknown action {other:?}"),
            ))
        }
    }
    Ok(Json(fleet.status(&name).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                FleetError::Timeout {
                    what: "lobby startup".to_string(),
                    elapsed: std::time::Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (FleetError::Pinned("lobby".to_string()), StatusCode::CONFLICT),
            (FleetError::NotFound("lobby".to_string()), StatusCode::NOT_FOUND),
            (
                FleetError::Backend("boom".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
