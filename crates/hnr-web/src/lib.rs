//! HTTP trigger surface for sync runs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hnr_core::{FeedType, SyncOutcome};
use hnr_sync::{maybe_build_scheduler, PipelineOptions, SyncConfig, SyncError, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hnr-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    /// Bearer token required on sync routes; `None` leaves them open.
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, auth_token: Option<String>) -> Self {
        Self {
            pipeline,
            auth_token,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    #[serde(rename = "type")]
    feed: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub processed: usize,
    pub has_more: bool,
    #[serde(rename = "type")]
    pub feed_type: FeedType,
    pub partial_failure: bool,
}

impl From<&SyncOutcome> for SyncResponse {
    fn from(outcome: &SyncOutcome) -> Self {
        Self {
            processed: outcome.processed,
            has_more: outcome.has_more,
            feed_type: outcome.feed_type,
            partial_failure: outcome.partial_failure,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync-hn-posts", get(sync_query_handler))
        .route("/api/sync/{feed}", get(sync_feed_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving sync trigger surface");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Builds the live pipeline from the environment, starts the cron scheduler if
/// enabled, and serves until interrupted.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(SyncPipeline::from_config(&config, &PipelineOptions::default()).await?);

    let scheduler = maybe_build_scheduler(pipeline.clone(), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!("cron scheduler started");
    }

    serve(
        AppState::new(pipeline, config.cron_auth_token.clone()),
        config.web_port,
    )
    .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn healthz_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn sync_query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let feed = FeedType::parse_or_default(query.feed.as_deref());
    let limit = match query.limit.as_deref().map(str::trim) {
        None | Some("") => state.pipeline.registry().policy_for(feed).limit,
        Some(raw) => match raw.parse::<usize>() {
            Ok(limit) if limit > 0 => limit,
            _ => return bad_request(format!("invalid limit: {raw}")),
        },
    };
    run_sync(&state, feed, limit).await
}

async fn sync_feed_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(feed): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let feed = FeedType::parse_or_default(Some(&feed));
    let limit = state.pipeline.registry().policy_for(feed).limit;
    run_sync(&state, feed, limit).await
}

async fn run_sync(state: &AppState, feed: FeedType, limit: usize) -> Response {
    match state.pipeline.run(feed, limit).await {
        Ok(outcome) => (StatusCode::OK, Json(SyncResponse::from(&outcome))).into_response(),
        Err(SyncError::InvalidRequest(message)) => bad_request(message),
        Err(err) => {
            warn!(feed = %feed, error = %err, "sync request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string(), "type": feed })),
            )
                .into_response()
        }
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(token) = state.auth_token.as_deref() else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized" })),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}
