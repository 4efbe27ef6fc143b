use axum::{extract::State, Json};

use crate::jobs::QueuedJob;
use crate::state::{AppState, JsonResult, ListResponse};
use crate::utils::internal_error;

/// Jobs waiting for a worker or for a retry, oldest first.
pub async fn list_jobs(State(state): State<AppState>) -> JsonResult<ListResponse<QueuedJob>> {
    let items = state.jobs.list_pending().map_err(internal_error)?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}
