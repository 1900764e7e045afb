use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::errors::DownloaderError;
use crate::models::{JobId, JobStatus, NewJob};

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// HTTP status for a domain error.
pub fn status_for(err: &DownloaderError) -> StatusCode {
    match err {
        DownloaderError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        DownloaderError::NotFound(_) => StatusCode::NOT_FOUND,
        DownloaderError::Conflict(_) => StatusCode::CONFLICT,
        DownloaderError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DownloaderError::Fetch(_) => StatusCode::BAD_GATEWAY,
        DownloaderError::Persistence(_)
        | DownloaderError::StartupCorruption(_)
        | DownloaderError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn domain_error(err: &DownloaderError) -> Response {
    error_response(status_for(err), err.code(), &err.to_string())
}

fn parse_id(raw: &str) -> Result<JobId, Response> {
    raw.parse::<JobId>().map_err(|e| {
        tracing::warn!("Rejected job id '{}'", raw);
        domain_error(&e)
    })
}

// ---------------------------------------------------------------------------
// Resource downloader endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub id: JobId,
    pub status: JobStatus,
    pub message: String,
}

/// POST /resourceDownloader
pub async fn create_resource(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewJob>, JsonRejection>,
) -> Response {
    let Json(new_job) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!("Rejected create request: {}", rejection.body_text());
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                &rejection.body_text(),
            );
        }
    };

    match state.orchestrator.create(new_job).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            [(header::LOCATION, format!("/resourceDownloader/{}", job.id))],
            Json(CreateResponse {
                id: job.id,
                status: job.status,
                message: format!("Downloading {} as job {}", job.resource_name, job.id),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Job creation failed: {}", e);
            domain_error(&e)
        }
    }
}

/// GET /resourceDownloader
pub async fn list_resources(State(state): State<Arc<AppState>>) -> Response {
    let jobs = state.orchestrator.list().await;
    tracing::debug!("Listing {} job(s)", jobs.len());
    (StatusCode::OK, Json(jobs)).into_response()
}

/// GET /resourceDownloader/{id}
pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.orchestrator.read(id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(e) => {
            tracing::debug!("Job lookup failed: {}", e);
            domain_error(&e)
        }
    }
}

/// DELETE /resourceDownloader/{id}
pub async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let id = match parse_id(&raw_id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.orchestrator.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::warn!("Delete of job {} failed: {}", id, e);
            domain_error(&e)
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon control
// ---------------------------------------------------------------------------

/// POST /api/shutdown
pub async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested");

    if let Some(ref tx) = state.shutdown_tx {
        let _ = tx.send(());
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "message": "Shutdown initiated",
        })),
    )
}
