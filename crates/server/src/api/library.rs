use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::scan::{queue_enrichment, run_scan, ScanError, ScanReport};
use crate::state::{
    AppState, EnrichSweepResponse, JsonResult, LibraryStatusResponse, ReplaceQuery, ScanStatus,
};
use crate::utils::{internal_error, json_error};

fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|value| value.as_secs())
}

pub async fn status(State(state): State<AppState>) -> JsonResult<LibraryStatusResponse> {
    let media = state.library.count_media().ok();
    let status = state.scan_status.read().clone();
    let response = match status {
        ScanStatus::Idle => LibraryStatusResponse {
            status: "idle",
            message: None,
            added: None,
            media,
            since: None,
        },
        ScanStatus::Scanning { started } => LibraryStatusResponse {
            status: "scanning",
            message: None,
            added: None,
            media,
            since: unix_secs(started),
        },
        ScanStatus::Ready { report, finished } => LibraryStatusResponse {
            status: "ready",
            message: Some(report.message),
            added: Some(report.added),
            media,
            since: unix_secs(finished),
        },
        ScanStatus::Error(message) => LibraryStatusResponse {
            status: "error",
            message: Some(message),
            added: None,
            media,
            since: None,
        },
    };
    Ok(Json(response))
}

/// Runs a scan inline and answers with its report.
pub async fn scan(State(state): State<AppState>) -> JsonResult<ScanReport> {
    match run_scan(&state).await {
        Ok(report) => Ok(Json(report)),
        Err(ScanError::InProgress) => Err(json_error(
            StatusCode::CONFLICT,
            "library scan already in progress",
        )),
        Err(err) => Err(internal_error(err)),
    }
}

/// Queues enrichment for records that never matched the provider.
pub async fn enrich_sweep(
    State(state): State<AppState>,
    Query(query): Query<ReplaceQuery>,
) -> JsonResult<EnrichSweepResponse> {
    if !state.resolver.is_enabled() {
        return Err(json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "metadata provider not configured",
        ));
    }
    let candidates = state
        .library
        .list_unenriched_media()
        .map_err(internal_error)?;
    let queued = queue_enrichment(&state, &candidates, query.replace);
    info!("Metadata sweep queued {} of {} candidates", queued, candidates.len());
    Ok(Json(EnrichSweepResponse { queued }))
}
