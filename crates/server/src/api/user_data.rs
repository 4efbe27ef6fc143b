use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    Json,
};
use common::WatchProgress;

use crate::playback::MediaView;
use crate::state::{AppState, ErrorResponse, JsonResult, ListResponse, ProgressRequest};
use crate::utils::{internal_error, json_error, not_found};

fn user_key(raw: &str) -> Result<&str, (StatusCode, Json<ErrorResponse>)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "user id is required"));
    }
    Ok(trimmed)
}

pub async fn list_progress(
    State(state): State<AppState>,
    AxumPath(user_id): AxumPath<String>,
) -> JsonResult<ListResponse<WatchProgress>> {
    let user = user_key(&user_id)?;
    let items = state.library.list_progress(user).map_err(internal_error)?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn get_progress(
    State(state): State<AppState>,
    AxumPath((user_id, media_id)): AxumPath<(String, String)>,
) -> JsonResult<WatchProgress> {
    let user = user_key(&user_id)?;
    match state
        .library
        .get_progress(user, &media_id)
        .map_err(internal_error)?
    {
        Some(progress) => Ok(Json(progress)),
        None => Err(not_found("progress")),
    }
}

/// Last write wins; the media must exist.
pub async fn set_progress(
    State(state): State<AppState>,
    AxumPath((user_id, media_id)): AxumPath<(String, String)>,
    Json(payload): Json<ProgressRequest>,
) -> JsonResult<WatchProgress> {
    let user = user_key(&user_id)?;
    match state
        .library
        .set_progress(user, &media_id, payload.progress_seconds)
        .map_err(internal_error)?
    {
        Some(progress) => Ok(Json(progress)),
        None => Err(not_found("media")),
    }
}

pub async fn list_favorites(
    State(state): State<AppState>,
    AxumPath(user_id): AxumPath<String>,
) -> JsonResult<ListResponse<MediaView>> {
    let user = user_key(&user_id)?;
    let items: Vec<MediaView> = state
        .library
        .list_favorites(user)
        .map_err(internal_error)?
        .into_iter()
        .map(MediaView::summary)
        .collect();
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn add_favorite(
    State(state): State<AppState>,
    AxumPath((user_id, media_id)): AxumPath<(String, String)>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let user = user_key(&user_id)?;
    if state
        .library
        .add_favorite(user, &media_id)
        .map_err(internal_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("media"))
    }
}

pub async fn remove_favorite(
    State(state): State<AppState>,
    AxumPath((user_id, media_id)): AxumPath<(String, String)>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let user = user_key(&user_id)?;
    if state
        .library
        .remove_favorite(user, &media_id)
        .map_err(internal_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("favorite"))
    }
}
