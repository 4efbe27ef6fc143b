use axum::http::StatusCode;
use axum::Json;

use crate::state::ErrorResponse;

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Maps a persistence failure to a 500 with the error text.
pub fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

pub fn not_found(what: &str) -> (StatusCode, Json<ErrorResponse>) {
    json_error(StatusCode::NOT_FOUND, format!("{} not found", what))
}

/// Keeps only the final path component of a client-supplied file name.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(raw).trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}
