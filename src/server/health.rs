use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::models::JobStatus;

#[derive(Debug, Default, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub active_fetches: usize,
    pub total_jobs: usize,
    pub jobs: JobCounts,
    pub version: String,
    pub data_dir: String,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Health check");

    let jobs = state.orchestrator.list().await;
    let mut counts = JobCounts::default();
    for job in &jobs {
        match job.status {
            JobStatus::Pending => counts.pending += 1,
            JobStatus::InProgress => counts.in_progress += 1,
            JobStatus::Succeeded => counts.succeeded += 1,
            JobStatus::Failed => counts.failed += 1,
        }
    }

    let data_dir = state
        .config
        .data_dir
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_fetches: state.orchestrator.active_count().await,
        total_jobs: jobs.len(),
        jobs: counts,
        version: env!("CARGO_PKG_VERSION").to_string(),
        data_dir,
    };

    (StatusCode::OK, Json(response))
}
