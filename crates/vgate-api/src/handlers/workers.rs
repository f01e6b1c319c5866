//! Worker handlers.

use axum::extract::{Path, State};
use axum::Json;
use vgate_models::WorkerId;

use crate::error::ApiResult;
use crate::orchestrator::WorkerView;
use crate::state::AppState;

/// GET /api/workers
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerView>>> {
    Ok(Json(state.orchestrator.workers().await?))
}

/// GET /api/workers/:worker_id
pub async fn get_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<WorkerView>> {
    Ok(Json(state.orchestrator.worker(&WorkerId::from(worker_id)).await?))
}
