//! Job handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use vgate_models::{JobId, JobView, SubmitJobRequest, TransitionRecord};

use crate::error::{ApiError, ApiResult};
use crate::orchestrator::SubmitJobResponse;
use crate::state::AppState;

/// Submit a job.
///
/// POST /api/jobs
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let Json(request) = payload.map_err(|e| ApiError::validation(e.body_text()))?;
    let response = state.orchestrator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/jobs/:job_id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let view = state.orchestrator.job(&JobId::from(job_id)).await?;
    Ok(Json(view))
}

/// GET /api/jobs/:job_id/history
pub async fn get_job_history(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Vec<TransitionRecord>>> {
    let history = state.orchestrator.history(&JobId::from(job_id)).await?;
    Ok(Json(history))
}

/// Cancel a job; terminal jobs answer 409.
///
/// POST /api/jobs/:job_id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let view = state.orchestrator.cancel(&JobId::from(job_id)).await?;
    Ok(Json(view))
}
