use crate::admission::Admission;
use crate::config::RankingConfig;
use crate::error::PipelineError;
use crate::event::ScoreSubmission;
use crate::ranking::{RankingEntry, RankingReader};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hyper::Server;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{error, info};

/// Header carrying the authenticated principal's numeric id.
pub const PRINCIPAL_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub admission: Admission,
    /// Read surface, when this process can see the aggregator's store.
    pub ranking: Option<Arc<dyn RankingReader>>,
    pub ranking_config: RankingConfig,
}

impl AppState {
    pub fn new(admission: Admission, ranking_config: RankingConfig) -> Self {
        Self {
            admission,
            ranking: None,
            ranking_config,
        }
    }

    pub fn with_ranking(mut self, ranking: Arc<dyn RankingReader>) -> Self {
        self.ranking = Some(ranking);
        self
    }
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "leaderboard-pipeline",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics() -> Response {
    match crate::metrics::render() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

fn principal(headers: &HeaderMap) -> Result<u64, Response> {
    let Some(value) = headers.get(PRINCIPAL_HEADER) else {
        return Err((StatusCode::UNAUTHORIZED, "Authorization required").into_response());
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Invalid user ID format").into_response())
}

fn error_response(err: PipelineError) -> Response {
    match err {
        PipelineError::Throttled { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
        }
        PipelineError::Validation(message) => (StatusCode::BAD_REQUEST, message).into_response(),
        other => {
            error!(error = %other, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

async fn create_score(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ScoreSubmission>, JsonRejection>,
) -> Response {
    let principal_id = match principal(&headers) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(e) = state.admission.throttle(principal_id) {
        return error_response(e);
    }
    let Json(submission) = match body {
        Ok(body) => body,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request format").into_response(),
    };
    match state.admission.admit(principal_id, submission) {
        Ok(admitted) => Json(admitted.session).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TopParams {
    mode: Option<String>,
    n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RankParams {
    mode: Option<String>,
}

fn ranking_of(state: &AppState) -> Result<&Arc<dyn RankingReader>, Response> {
    state
        .ranking
        .as_ref()
        .ok_or_else(|| (StatusCode::NOT_FOUND, "ranking not served here").into_response())
}

async fn top(State(state): State<AppState>, Query(params): Query<TopParams>) -> Response {
    let ranking = match ranking_of(&state) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let mode = params
        .mode
        .unwrap_or_else(|| state.ranking_config.default_mode.clone());
    let n = params.n.unwrap_or(state.ranking_config.top_n);
    match ranking.top_n(&mode, n).await {
        Ok(entries) => Json::<Vec<RankingEntry>>(entries).into_response(),
        Err(e) => error_response(e),
    }
}

async fn rank(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<RankParams>,
) -> Response {
    let ranking = match ranking_of(&state) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let mode = params
        .mode
        .unwrap_or_else(|| state.ranking_config.default_mode.clone());
    match ranking.rank_of(&mode, &user_id).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "user not found").into_response(),
        Err(e) => error_response(e),
    }
}

/// Create the HTTP router with all routes
pub fn router(state: AppState) -> Router {
    let security_headers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'; script-src 'self'"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/score", post(create_score))
        .route("/v1/leaderboard/top", get(top))
        .route("/v1/rank/:user_id", get(rank))
        .layer(security_headers)
        .with_state(state)
}

/// Serve until the shutdown signal fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = router(state);
    info!("HTTP server running on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("HTTP server shutting down");
        })
        .await?;
    Ok(())
}
