//! HTTP trigger for the ingestion job.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use firewatch_ingest::{job_from_config, FirewatchConfig, IngestJob, RunErrorCode, RunOutcome};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "firewatch-web";

#[derive(Clone)]
pub struct AppState {
    pub job: Arc<IngestJob>,
    /// Expected bearer token; `None` leaves the trigger open.
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(job: Arc<IngestJob>, cron_secret: Option<String>) -> Self {
        Self { job, cron_secret }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/cron/firms", get(cron_firms_handler).post(cron_firms_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &FirewatchConfig) -> anyhow::Result<()> {
    let job = Arc::new(job_from_config(config)?);
    let state = AppState::new(job, config.cron_secret.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving ingestion trigger");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret)
}

pub fn outcome_status(outcome: &RunOutcome) -> StatusCode {
    match outcome.code {
        None => StatusCode::OK,
        Some(RunErrorCode::NoApiKey) => StatusCode::SERVICE_UNAVAILABLE,
        Some(RunErrorCode::UpstreamError) => StatusCode::BAD_GATEWAY,
        Some(RunErrorCode::InternalError) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn cron_firms_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, state.cron_secret.as_deref()) {
        warn!("rejected ingestion trigger with bad credentials");
        return (StatusCode::UNAUTHORIZED, Json(ErrorBody { error: "Unauthorized" })).into_response();
    }
    let outcome = state.job.run().await;
    (outcome_status(&outcome), Json(outcome)).into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}
