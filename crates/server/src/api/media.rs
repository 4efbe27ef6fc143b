use std::path::{Path, PathBuf};

use axum::{
    extract::{Multipart, Path as AxumPath, Query, State},
    http::StatusCode,
    Json,
};
use common::{is_video_file, MediaType, StorageLocator};
use library::{EpisodeInsert, InsertOutcome, MediaPatch, NewEpisode, NewMedia};
use metadata::parse_file_name;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::external::{placeholder_overview, placeholder_poster};
use crate::jobs::Job;
use crate::playback::{EpisodeView, MediaView};
use crate::state::{
    AcceptedResponse, AppState, CreateEpisodeRequest, CreateMediaRequest, ErrorResponse,
    JsonResult, ListResponse, MediaQuery, ReplaceQuery, StatusJsonResult, UpdateMediaRequest,
};
use crate::utils::{internal_error, json_error, not_found, sanitize_file_name};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 500;

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn list_media(
    State(state): State<AppState>,
    Query(query): Query<MediaQuery>,
) -> JsonResult<ListResponse<MediaView>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let (items, total) = state
        .library
        .list_media(query.search.as_deref(), limit, offset)
        .map_err(internal_error)?;
    Ok(Json(ListResponse {
        items: items.into_iter().map(MediaView::summary).collect(),
        total,
    }))
}

/// Rejects `store:` paths that do not name both a bucket and a key.
fn validate_storage_path(value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(json_error(StatusCode::BAD_REQUEST, "storage_path is required"));
    }
    StorageLocator::parse(trimmed).map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(trimmed.to_string())
}

fn file_name_of(storage_path: &str) -> String {
    StorageLocator::parse(storage_path)
        .ok()
        .and_then(|locator| locator.file_name())
        .unwrap_or_else(|| storage_path.to_string())
}

struct MediaDraft {
    title: Option<String>,
    year: Option<i32>,
    overview: Option<String>,
    media_type: Option<MediaType>,
    poster_url: Option<String>,
    backdrop_url: Option<String>,
    needs_transcode: bool,
}

/// Inserts a record and, when asked, queues its transcode. Missing title and
/// artwork fall back to what the file name gives.
fn register(
    state: &AppState,
    storage_path: String,
    draft: MediaDraft,
) -> StatusJsonResult<MediaView> {
    let file_name = file_name_of(&storage_path);
    let parsed = parse_file_name(&file_name);
    let title = draft
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or(parsed.title);
    let new_media = NewMedia {
        poster_url: draft.poster_url.or_else(|| Some(placeholder_poster(&title))),
        overview: draft.overview.or_else(|| Some(placeholder_overview(&file_name))),
        year: draft.year.or(parsed.year),
        title,
        media_type: draft.media_type.unwrap_or(MediaType::Movie),
        storage_path,
        original_file_name: Some(file_name),
        backdrop_url: draft.backdrop_url,
        needs_transcode: draft.needs_transcode,
    };
    let record = match state
        .library
        .insert_media_if_absent(new_media)
        .map_err(internal_error)?
    {
        InsertOutcome::Inserted(record) => record,
        InsertOutcome::AlreadyExists(id) => {
            return Err(json_error(
                StatusCode::CONFLICT,
                format!("storage path already registered by {}", id),
            ))
        }
    };
    if record.needs_transcode {
        if let Err(err) = state.jobs.enqueue(Job::Transcode {
            media_id: record.id.clone(),
        }) {
            warn!("Failed to queue transcode for {}: {}", record.id, err);
        }
    }
    info!("Created media '{}' ({})", record.title, record.id);
    Ok((StatusCode::CREATED, Json(MediaView::summary(record))))
}

pub async fn create_media(
    State(state): State<AppState>,
    Json(payload): Json<CreateMediaRequest>,
) -> StatusJsonResult<MediaView> {
    let storage_path = validate_storage_path(&payload.storage_path)?;
    register(
        &state,
        storage_path,
        MediaDraft {
            title: payload.title,
            year: payload.year,
            overview: payload.overview,
            media_type: payload.media_type,
            poster_url: payload.poster_url,
            backdrop_url: payload.backdrop_url,
            needs_transcode: payload.needs_transcode,
        },
    )
}

#[derive(Default)]
struct UploadForm {
    stored: Option<PathBuf>,
    title: Option<String>,
    media_type: Option<MediaType>,
    needs_transcode: bool,
}

/// Multipart upload into the local media root. Fields: `file` (required),
/// `title`, `media_type` and `transcode` (`true` queues the quality ladder).
pub async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> StatusJsonResult<MediaView> {
    let media_root = state.paths.media_root.clone().ok_or_else(|| {
        json_error(StatusCode::SERVICE_UNAVAILABLE, "media directory not configured")
    })?;
    tokio::fs::create_dir_all(&media_root)
        .await
        .map_err(internal_error)?;

    let mut form = UploadForm::default();
    if let Err(err) = read_upload(&mut multipart, &media_root, &mut form).await {
        if let Some(stored) = &form.stored {
            let _ = tokio::fs::remove_file(stored).await;
        }
        return Err(err);
    }

    let stored = form
        .stored
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "file is required"))?;
    // same form as the scanner produces, so a later scan does not duplicate it
    let canonical = stored.canonicalize().unwrap_or_else(|_| stored.clone());
    let result = register(
        &state,
        canonical.to_string_lossy().into_owned(),
        MediaDraft {
            title: form.title,
            year: None,
            overview: None,
            media_type: form.media_type,
            poster_url: None,
            backdrop_url: None,
            needs_transcode: form.needs_transcode,
        },
    );
    if result.is_err() {
        let _ = tokio::fs::remove_file(&stored).await;
    }
    result
}

async fn read_upload(
    multipart: &mut Multipart,
    media_root: &Path,
    form: &mut UploadForm,
) -> Result<(), ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" if form.stored.is_none() => {
                let file_name = field
                    .file_name()
                    .and_then(sanitize_file_name)
                    .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "file name is required"))?;
                if !is_video_file(Path::new(&file_name)) {
                    return Err(json_error(
                        StatusCode::BAD_REQUEST,
                        format!("unsupported video type: {}", file_name),
                    ));
                }
                let target = unique_target(media_root, &file_name);
                form.stored = Some(target.clone());
                write_field(&mut field, &target).await?;
            }
            "title" => form.title = field.text().await.ok(),
            "media_type" => {
                form.media_type = match field.text().await.ok().as_deref().map(str::trim) {
                    Some("series") => Some(MediaType::Series),
                    Some("movie") | Some("") | None => Some(MediaType::Movie),
                    Some(other) => {
                        return Err(json_error(
                            StatusCode::BAD_REQUEST,
                            format!("unknown media_type: {}", other),
                        ))
                    }
                }
            }
            "transcode" => {
                form.needs_transcode = matches!(
                    field.text().await.ok().as_deref().map(str::trim),
                    Some("true") | Some("1") | Some("on")
                )
            }
            _ => {}
        }
    }
    Ok(())
}

fn unique_target(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let prefix = Uuid::new_v4().simple().to_string();
    dir.join(format!("{}_{}", &prefix[..8], file_name))
}

async fn write_field(
    field: &mut axum::extract::multipart::Field<'_>,
    target: &Path,
) -> Result<(), ApiError> {
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(internal_error)?;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        file.write_all(&chunk).await.map_err(internal_error)?;
    }
    file.flush().await.map_err(internal_error)?;
    Ok(())
}

pub async fn get_media(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
) -> JsonResult<MediaView> {
    match state.library.get_media(&media_id).map_err(internal_error)? {
        Some(record) => Ok(Json(MediaView::summary(record))),
        None => Err(not_found("media")),
    }
}

pub async fn update_media(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
    Json(payload): Json<UpdateMediaRequest>,
) -> JsonResult<MediaView> {
    let patch = MediaPatch {
        title: payload.title,
        year: payload.year,
        overview: payload.overview,
        media_type: payload.media_type,
        poster_url: payload.poster_url,
        backdrop_url: payload.backdrop_url,
        genres: payload.genres,
    };
    match state
        .library
        .update_media(&media_id, patch)
        .map_err(internal_error)?
    {
        Some(record) => Ok(Json(MediaView::summary(record))),
        None => Err(not_found("media")),
    }
}

/// Removes the record with its episodes, subtitles and user rows, then the
/// generated files. Source video files are left in place.
pub async fn delete_media(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
) -> JsonResult<()> {
    let deleted = match state
        .library
        .delete_media(&media_id)
        .map_err(internal_error)?
    {
        Some(deleted) => deleted,
        None => return Err(not_found("media")),
    };
    let mut generated = Vec::new();
    for url in deleted.record.renditions.values() {
        generated.push(local_file(&state.paths.renditions_dir, url));
    }
    for episode in &deleted.episodes {
        for url in episode.renditions.values() {
            generated.push(local_file(&state.paths.renditions_dir, url));
        }
    }
    for subtitle in &deleted.subtitles {
        generated.push(local_file(&state.paths.subtitles_dir, &subtitle.url));
    }
    for path in generated.into_iter().flatten() {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), err);
            }
        }
    }
    info!("Deleted media '{}' ({})", deleted.record.title, media_id);
    Ok(Json(()))
}

/// Maps a public URL we generated back to its file in `dir`.
pub(crate) fn local_file(dir: &Path, url: &str) -> Option<PathBuf> {
    let name = url.rsplit('/').next()?;
    let decoded = urlencoding::decode(name).ok()?;
    let name = sanitize_file_name(&decoded)?;
    Some(dir.join(name))
}

pub async fn get_playback(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
) -> JsonResult<MediaView> {
    match state
        .playback
        .resolve_media(&state.library, &media_id)
        .await
        .map_err(internal_error)?
    {
        Some(view) => Ok(Json(view)),
        None => Err(not_found("media")),
    }
}

pub async fn get_episode_playback(
    State(state): State<AppState>,
    AxumPath(episode_id): AxumPath<String>,
) -> JsonResult<EpisodeView> {
    match state
        .playback
        .resolve_episode(&state.library, &episode_id)
        .await
        .map_err(internal_error)?
    {
        Some(view) => Ok(Json(view)),
        None => Err(not_found("episode")),
    }
}

pub async fn enqueue_transcode(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
) -> StatusJsonResult<AcceptedResponse> {
    if state
        .library
        .get_media(&media_id)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("media"));
    }
    let queued = state
        .jobs
        .enqueue(Job::Transcode { media_id })
        .map_err(internal_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "queued",
            job_id: queued.id,
        }),
    ))
}

pub async fn enqueue_enrichment(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
    Query(query): Query<ReplaceQuery>,
) -> StatusJsonResult<AcceptedResponse> {
    if state
        .library
        .get_media(&media_id)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("media"));
    }
    let queued = state
        .jobs
        .enqueue(Job::Enrich {
            media_id,
            replace: query.replace,
        })
        .map_err(internal_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "queued",
            job_id: queued.id,
        }),
    ))
}

pub async fn list_episodes(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
) -> JsonResult<ListResponse<EpisodeView>> {
    if state
        .library
        .get_media(&media_id)
        .map_err(internal_error)?
        .is_none()
    {
        return Err(not_found("media"));
    }
    let episodes = state
        .library
        .list_episodes(&media_id)
        .map_err(internal_error)?;
    let total = episodes.len();
    Ok(Json(ListResponse {
        items: episodes
            .into_iter()
            .map(|record| EpisodeView {
                record,
                playback_url: None,
            })
            .collect(),
        total,
    }))
}

pub async fn create_episode(
    State(state): State<AppState>,
    AxumPath(media_id): AxumPath<String>,
    Json(payload): Json<CreateEpisodeRequest>,
) -> StatusJsonResult<EpisodeView> {
    let storage_path = validate_storage_path(&payload.storage_path)?;
    let title = payload
        .title
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| parse_file_name(&file_name_of(&storage_path)).title);
    let draft = NewEpisode {
        media_id,
        season_number: payload.season_number,
        episode_number: payload.episode_number,
        title,
        overview: payload.overview,
        still_url: payload.still_url,
        storage_path,
    };
    match state.library.create_episode(draft).map_err(internal_error)? {
        EpisodeInsert::Inserted(record) => Ok((
            StatusCode::CREATED,
            Json(EpisodeView {
                record,
                playback_url: None,
            }),
        )),
        EpisodeInsert::MissingMedia => Err(not_found("media")),
        EpisodeInsert::DuplicatePath(id) => Err(json_error(
            StatusCode::CONFLICT,
            format!("storage path already registered by episode {}", id),
        )),
        EpisodeInsert::DuplicateNumber(id) => Err(json_error(
            StatusCode::CONFLICT,
            format!("season/episode number already used by {}", id),
        )),
    }
}
