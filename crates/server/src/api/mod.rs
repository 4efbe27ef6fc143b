pub mod jobs;
pub mod library;
pub mod media;
pub mod series;
pub mod subtitles;
pub mod user_data;

use axum::{
    extract::DefaultBodyLimit,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};

use crate::state::{AppState, HealthResponse};

pub fn api_router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/media/upload", post(media::upload_media))
        .layer(DefaultBodyLimit::disable());

    Router::new()
        .route("/health", get(health))
        .route("/library/status", get(library::status))
        .route("/library/scan", post(library::scan))
        .route("/library/enrich", post(library::enrich_sweep))
        .route("/media", get(media::list_media).post(media::create_media))
        .route(
            "/media/:media_id",
            get(media::get_media)
                .patch(media::update_media)
                .delete(media::delete_media),
        )
        .route("/media/:media_id/playback", get(media::get_playback))
        .route("/media/:media_id/transcode", post(media::enqueue_transcode))
        .route("/media/:media_id/enrich", post(media::enqueue_enrichment))
        .route(
            "/media/:media_id/episodes",
            get(media::list_episodes).post(media::create_episode),
        )
        .route(
            "/media/:media_id/seasons/:season_number/import",
            post(series::import_season),
        )
        .route("/episodes/:episode_id/playback", get(media::get_episode_playback))
        .route(
            "/media/:media_id/subtitles",
            get(subtitles::list_subtitles).post(subtitles::upload_subtitle),
        )
        .route("/subtitles/:subtitle_id", delete(subtitles::delete_subtitle))
        .route("/users/:user_id/progress", get(user_data::list_progress))
        .route(
            "/users/:user_id/progress/:media_id",
            get(user_data::get_progress).put(user_data::set_progress),
        )
        .route("/users/:user_id/favorites", get(user_data::list_favorites))
        .route(
            "/users/:user_id/favorites/:media_id",
            put(user_data::add_favorite)
                .post(user_data::add_favorite)
                .delete(user_data::remove_favorite),
        )
        .route("/jobs", get(jobs::list_jobs))
        .merge(uploads)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}
