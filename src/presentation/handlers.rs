// HTTP request handlers
use crate::application::signal_service::{SignalQuery, SignalResponse};
use crate::application::subscription::{StreamError, SubscriptionStatus, VariableSpec};
use crate::domain::FetchResult;
use crate::presentation::app_state::AppState;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

#[derive(Deserialize)]
pub struct StartRequest {
    pub variables: Vec<VariableSpec>,
}

#[derive(Deserialize)]
pub struct StopQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct LiveSample {
    pub data: FetchResult,
    /// Samples still queued for the variable.
    pub pending: usize,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LiveStatus {
    pub source: String,
    pub status: SubscriptionStatus,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/signals", get(get_signal).delete(release_signal))
        .route("/cache", delete(clear_cache))
        .route("/live/:source/start", post(start_live))
        .route("/live/:source/next/:variable", get(next_live))
        .route("/live/:source/stop", post(stop_live))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Refresh one plot binding and return its buffers
pub async fn get_signal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalQuery>,
) -> Json<SignalResponse> {
    Json(state.signal_service.query(query).await)
}

/// Forget a plot binding
pub async fn release_signal(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalQuery>,
) -> StatusCode {
    if state.signal_service.release(&query).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Drop every cached fetch result
pub async fn clear_cache(State(state): State<Arc<AppState>>) -> StatusCode {
    state.signal_service.clear_cache().await;
    StatusCode::NO_CONTENT
}

pub async fn start_live(
    Path(source): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<LiveStatus>, (StatusCode, String)> {
    match state.signal_service.start_live(&source, request.variables).await {
        Ok(()) => {
            let status = state
                .signal_service
                .live_status(&source)
                .await
                .unwrap_or(SubscriptionStatus::Started);
            Ok(Json(LiveStatus { source, status }))
        }
        Err(e @ StreamError::AlreadyStarted(_)) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e) => {
            tracing::warn!("Live start for {} failed: {}", source, e);
            Err((StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

pub async fn next_live(
    Path((source, variable)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<LiveSample>, StatusCode> {
    state
        .signal_service
        .next_live(&source, &variable)
        .await
        .map(|(data, pending)| Json(LiveSample { data, pending }))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn stop_live(
    Path(source): Path<String>,
    Query(query): Query<StopQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<LiveStatus>, StatusCode> {
    let status = state
        .signal_service
        .stop_live(&source, query.wait)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(LiveStatus { source, status }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::access::tests::RampProvider;
    use crate::application::signal_service::tests::{query, service};

    fn state(lines: Vec<String>) -> Arc<AppState> {
        Arc::new(AppState {
            signal_service: service(Arc::new(RampProvider::default()), lines),
        })
    }

    #[tokio::test]
    async fn test_get_signal_returns_buffers_and_status() {
        let state = state(Vec::new());
        let Json(response) = get_signal(State(state.clone()), Query(query("ip", 0.0, 10.0))).await;
        assert!(response.status.is_success());
        assert_eq!(response.data.x.len(), 11);

        let released = release_signal(State(state.clone()), Query(query("ip", 0.0, 10.0))).await;
        assert_eq!(released, StatusCode::NO_CONTENT);
        assert_eq!(clear_cache(State(state)).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_live_routes() {
        let state = state(vec!["V 1 1 1 V 2 A".to_string()]);

        let missing = next_live(Path(("tokamak".to_string(), "V".to_string())), State(state.clone())).await;
        assert_eq!(missing.err(), Some(StatusCode::NOT_FOUND));

        let request = StartRequest {
            variables: vec!["V".into()],
        };
        let Json(started) = start_live(Path("tokamak".to_string()), State(state.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(started.status, SubscriptionStatus::Started);

        let again = StartRequest {
            variables: vec!["V".into()],
        };
        let conflict = start_live(Path("tokamak".to_string()), State(state.clone()), Json(again)).await;
        assert_eq!(conflict.err().map(|e| e.0), Some(StatusCode::CONFLICT));

        let Json(stopped) = stop_live(Path("tokamak".to_string()), Query(StopQuery { wait: true }), State(state))
            .await
            .unwrap();
        assert_eq!(stopped.status, SubscriptionStatus::Stopped);
    }
}
