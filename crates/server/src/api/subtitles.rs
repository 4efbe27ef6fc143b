use axum::{
    extract::{Multipart, Path as AxumPath, State},
    http::StatusCode,
    Json,
};
use common::SubtitleRecord;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::media::local_file;
use crate::state::{AppState, JsonResult, ListResponse, StatusJsonResult};
use crate::subtitles::{SubtitleError, SubtitleNormalizer};
use crate::utils::{internal_error, json_error, not_found, sanitize_file_name};

pub async fn list_subtitles(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
) -> JsonResult<ListResponse<SubtitleRecord>> {
    if state
        .library
        .get_media(&media_id)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("media"));
    }
    let items = state
        .library
        .list_subtitles(&media_id)
        .map_err(internal_error)?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

/// Multipart fields: `file` (.srt or .vtt), `language`, `label`.
pub async fn upload_subtitle(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
    mut multipart: Multipart,
) -> StatusJsonResult<SubtitleRecord> {
    if state
        .library
        .get_media(&media_id)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("media"));
    }

    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut language = None;
    let mut label = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .and_then(sanitize_file_name)
                    .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "file name is required"))?;
                SubtitleNormalizer::validate_name(&file_name)
                    .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;
                upload = Some((file_name, bytes.to_vec()));
            }
            "language" => language = field.text().await.ok(),
            "label" => label = field.text().await.ok(),
            _ => {}
        }
    }

    let (file_name, bytes) =
        upload.ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "file is required"))?;
    let language = language
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "und".to_string());
    let label = label
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| language.clone());

    let normalizer = state.subtitles.clone();
    let dir = state.paths.subtitles_dir.clone();
    let stem = Uuid::new_v4().to_string();
    let vtt_name = tokio::task::spawn_blocking(move || {
        normalizer.ingest(&dir, &stem, &file_name, &bytes)
    })
    .await
    .map_err(internal_error)?
    .map_err(|err| match err {
        SubtitleError::UnsupportedFormat(_) => json_error(StatusCode::BAD_REQUEST, err.to_string()),
        other => internal_error(other),
    })?;

    let prefix = state.config.media.subtitles_prefix.trim_end_matches('/');
    let url = format!("{}/{}", prefix, vtt_name);
    match state
        .library
        .add_subtitle(&media_id, &language, &label, &url)
        .map_err(internal_error)?
    {
        Some(record) => {
            info!("Subtitle {} ({}) added to {}", record.id, record.language, media_id);
            Ok((StatusCode::CREATED, Json(record)))
        }
        None => {
            // media vanished while the file was being converted
            let _ = tokio::fs::remove_file(state.paths.subtitles_dir.join(&vtt_name)).await;
            Err(not_found("media"))
        }
    }
}

pub async fn delete_subtitle(
    State(state): State<AppState>,
    AxumPath(subtitle_id): AxumPath<String>,
) -> JsonResult<SubtitleRecord> {
    let record = match state
        .library
        .delete_subtitle(&subtitle_id)
        .map_err(internal_error)?
    {
        Some(record) => record,
        None => return Err(not_found("subtitle")),
    };
    if let Some(path) = local_file(&state.paths.subtitles_dir, &record.url) {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove subtitle file {}: {}", path.display(), err);
        }
    }
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use library::{InsertOutcome, NewMedia};

    #[tokio::test]
    async fn listing_and_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None);
        let (status, _) = list_subtitles(State(state.clone()), AxumPath("none".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let media_id = match state
            .library
            .insert_media_if_absent(NewMedia {
                title: "Film".to_string(),
                year: None,
                overview: None,
                media_type: common::MediaType::Movie,
                storage_path: "/srv/film.mkv".to_string(),
                original_file_name: None,
                poster_url: None,
                backdrop_url: None,
                needs_transcode: false,
            })
            .unwrap()
        {
            InsertOutcome::Inserted(record) => record.id,
            InsertOutcome::AlreadyExists(id) => id,
        };

        let stem = "fixed";
        let vtt = state
            .subtitles
            .ingest(
                &state.paths.subtitles_dir,
                stem,
                "film.srt",
                b"1\n00:00:20,500 --> 00:00:21,000\nhi\n",
            )
            .unwrap();
        let url = format!("/files/uploads/subtitles/{}", vtt);
        let record = state
            .library
            .add_subtitle(&media_id, "tr", "Turkish", &url)
            .unwrap()
            .unwrap();

        let Json(list) = list_subtitles(State(state.clone()), AxumPath(media_id))
            .await
            .unwrap();
        assert_eq!(list.total, 1);

        let file = state.paths.subtitles_dir.join("fixed.vtt");
        assert!(file.exists());
        let Json(deleted) = delete_subtitle(State(state.clone()), AxumPath(record.id.clone()))
            .await
            .unwrap();
        assert_eq!(deleted.id, record.id);
        assert!(!file.exists());
        let (status, _) = delete_subtitle(State(state), AxumPath(record.id))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
