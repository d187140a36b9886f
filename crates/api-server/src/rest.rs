//! REST handlers for click entry and operational endpoints.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};
use tracker_core::types::{RouterRef, UtmParams};
use tracker_core::TrackerError;
use tracker_ingest::{ClickIngestor, ClickRequest};
use tracker_store::Store;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<ClickIngestor>,
    pub store: Store,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub redirect: String,
    pub composed_message: String,
    /// Milliseconds spent handling the click.
    pub duration: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// Maps ingest failures to status codes. Infrastructure detail stays in
/// the logs.
pub struct ApiError(TrackerError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            TrackerError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_click"),
            TrackerError::NotFound(_) => (StatusCode::NOT_FOUND, "campaign_not_found"),
            TrackerError::UnsupportedConfig(_) => (StatusCode::UNPROCESSABLE_ENTITY, "campaign_misconfigured"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "click_processing_failed"),
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal processing error".to_string()
        } else {
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                success: false,
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

/// First `X-Forwarded-For` hop, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// GET /c/:id/process: register a click and hand back the chat link.
pub async fn process_click(
    State(state): State<AppState>,
    Path(router): Path<String>,
    Query(utm): Query<UtmParams>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let start = Instant::now();
    let request = ClickRequest {
        router: RouterRef::parse(&router),
        utm,
        client_ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    match state.ingestor.ingest(request).await {
        Ok(response) => {
            metrics::counter!("api.clicks").increment(1);
            Ok(Json(ProcessResponse {
                success: true,
                redirect: response.redirect_url,
                composed_message: response.composed_message,
                duration: start.elapsed().as_millis() as u64,
            }))
        }
        Err(e) if e.is_drop() => {
            warn!(router = %router, error = %e, "Click rejected");
            metrics::counter!("api.validation_errors").increment(1);
            Err(ApiError(e))
        }
        Err(e) => {
            error!(router = %router, error = %e, "Click processing failed");
            metrics::counter!("api.errors").increment(1);
            Err(ApiError(e))
        }
    }
}

/// GET /health: Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready: 200 once the datastore answers.
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.store.backend().get("ready").await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Datastore not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live: liveness check.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.2:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("10.0.0.2"));

        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(peer)).as_deref(), Some("203.0.113.9"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e| ApiError(e).into_response().status();
        assert_eq!(status(TrackerError::Validation("ip".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(TrackerError::NotFound("c".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(TrackerError::UnsupportedConfig("s".into())), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(TrackerError::Datastore("down".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
