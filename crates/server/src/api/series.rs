use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    Json,
};
use common::{MediaType, StorageLocator};
use library::{EpisodeInsert, NewEpisode};
use tracing::{info, warn};

use crate::external::SeasonEpisode;
use crate::state::{AppState, ImportSeasonRequest, ImportSeasonResponse, JsonResult};
use crate::utils::{internal_error, json_error, not_found};

fn render_path(template: &str, season_number: u32, episode_number: u32) -> String {
    template
        .replace("{season}", &format!("{:02}", season_number))
        .replace("{episode}", &format!("{:02}", episode_number))
}

/// Registers every episode the provider lists for one season. Episodes whose
/// number or storage path is already taken are counted as skipped.
pub async fn import_season(
    State(state): State<AppState>,
    AxumPath((media_id, season_number)): AxumPath<(String, u32)>,
    Json(payload): Json<ImportSeasonRequest>,
) -> JsonResult<ImportSeasonResponse> {
    let template = payload.path_template.trim();
    if !template.contains("{episode}") {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "path_template must contain {episode}",
        ));
    }
    let record = state
        .library
        .get_media(&media_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("media"))?;
    if record.media_type != MediaType::Series {
        return Err(json_error(StatusCode::BAD_REQUEST, "media is not a series"));
    }
    let tmdb_id = record.tmdb_id.ok_or_else(|| {
        json_error(
            StatusCode::CONFLICT,
            "media has no provider match; enrich it first",
        )
    })?;
    if !state.resolver.is_enabled() {
        return Err(json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "metadata provider not configured",
        ));
    }

    let episodes = state
        .resolver
        .fetch_season(tmdb_id, season_number)
        .await
        .map_err(|err| {
            warn!("Season lookup failed for tmdb {} season {}: {}", tmdb_id, season_number, err);
            json_error(StatusCode::BAD_GATEWAY, "metadata provider request failed")
        })?;

    // every path is checked before anything is written
    let mut drafts = Vec::with_capacity(episodes.len());
    for episode in episodes {
        let storage_path = render_path(template, season_number, episode.episode_number);
        StorageLocator::parse(&storage_path)
            .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;
        drafts.push(draft(&media_id, season_number, episode, storage_path));
    }

    let mut created = Vec::new();
    let mut skipped = 0;
    for draft in drafts {
        match state.library.create_episode(draft).map_err(internal_error)? {
            EpisodeInsert::Inserted(episode) => created.push(episode),
            EpisodeInsert::DuplicatePath(_) | EpisodeInsert::DuplicateNumber(_) => skipped += 1,
            EpisodeInsert::MissingMedia => return Err(not_found("media")),
        }
    }
    info!(
        "Imported season {} of {}: {} created, {} skipped",
        season_number,
        media_id,
        created.len(),
        skipped
    );
    Ok(Json(ImportSeasonResponse { created, skipped }))
}

fn draft(
    media_id: &str,
    season_number: u32,
    episode: SeasonEpisode,
    storage_path: String,
) -> NewEpisode {
    NewEpisode {
        media_id: media_id.to_string(),
        season_number,
        episode_number: episode.episode_number,
        title: episode
            .title
            .unwrap_or_else(|| format!("Episode {}", episode.episode_number)),
        overview: episode.overview,
        still_url: episode.still_url,
        storage_path,
    }
}
