use std::sync::Arc;
use std::time::SystemTime;

use axum::http::StatusCode;
use axum::Json;
use common::{EpisodeRecord, MediaType};
use library::Library;
use notify::RecommendedWatcher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{MediaPaths, ServerConfig};
use crate::external::MetadataResolver;
use crate::jobs::JobQueue;
use crate::object_store::ObjectStore;
use crate::playback::PlaybackResolver;
use crate::scan::ScanReport;
use crate::subtitles::SubtitleNormalizer;
use crate::transcode::TranscodeEngine;

#[derive(Clone)]
pub struct AppState {
    pub library: Library,
    pub config: Arc<ServerConfig>,
    pub paths: Arc<MediaPaths>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub resolver: MetadataResolver,
    pub playback: PlaybackResolver,
    pub transcoder: TranscodeEngine,
    pub subtitles: SubtitleNormalizer,
    pub jobs: JobQueue,
    pub scan_status: Arc<RwLock<ScanStatus>>,
    pub watcher: Arc<RwLock<Option<RecommendedWatcher>>>,
}

#[derive(Clone, Debug)]
pub enum ScanStatus {
    Idle,
    Scanning { started: SystemTime },
    Ready { report: ScanReport, finished: SystemTime },
    Error(String),
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize, Debug)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct LibraryStatusResponse {
    pub status: &'static str,
    pub message: Option<String>,
    pub added: Option<usize>,
    pub media: Option<usize>,
    pub since: Option<u64>,
}

#[derive(Serialize, Debug)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub job_id: String,
}

#[derive(Serialize, Debug)]
pub struct EnrichSweepResponse {
    pub queued: usize,
}

#[derive(Debug, Deserialize)]
pub struct MediaQuery {
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceQuery {
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateMediaRequest {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub media_type: Option<MediaType>,
    pub storage_path: String,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    #[serde(default)]
    pub needs_transcode: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMediaRequest {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub media_type: Option<MediaType>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub genres: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateEpisodeRequest {
    pub season_number: u32,
    pub episode_number: u32,
    pub title: Option<String>,
    pub overview: Option<String>,
    pub still_url: Option<String>,
    pub storage_path: String,
}

/// `{season}` and `{episode}` in the template expand to two-digit numbers.
#[derive(Debug, Deserialize)]
pub struct ImportSeasonRequest {
    pub path_template: String,
}

#[derive(Debug, Serialize)]
pub struct ImportSeasonResponse {
    pub created: Vec<EpisodeRecord>,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub progress_seconds: u32,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// For handlers that answer with something other than 200.
pub type StatusJsonResult<T> = Result<(StatusCode, Json<T>), (StatusCode, Json<ErrorResponse>)>;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::jobs::JobQueueConfig;
    use crate::transcode::FfmpegEncoder;

    /// Fully wired state rooted in `dir`. Job workers are not started.
    pub(crate) fn test_state(dir: &Path, object_store: Option<Arc<dyn ObjectStore>>) -> AppState {
        let library = Library::open(&dir.join("index.redb")).unwrap();
        let mut config = ServerConfig::default();
        config.object_store.buckets = vec!["films".to_string()];
        let paths = MediaPaths {
            media_root: Some(dir.join("videos")),
            static_root: dir.to_path_buf(),
            renditions_dir: dir.join("renditions"),
            subtitles_dir: dir.join("subtitles"),
        };
        std::fs::create_dir_all(dir.join("videos")).unwrap();
        let jobs = JobQueue::open(
            library.db(),
            JobQueueConfig {
                workers: 1,
                max_attempts: 1,
                retry_delay: Duration::from_millis(1),
                conflict_delay: Duration::from_millis(1),
            },
        )
        .unwrap();
        AppState {
            playback: PlaybackResolver::new(
                object_store.clone(),
                &config.media.local_media_prefix,
            ),
            transcoder: TranscodeEngine::new(
                Arc::new(FfmpegEncoder::new("ffmpeg")),
                paths.renditions_dir.clone(),
                &config.media.renditions_prefix,
            ),
            subtitles: SubtitleNormalizer::new(&config.subtitles.fallback_encoding).unwrap(),
            resolver: MetadataResolver::new(reqwest::Client::new(), &config.metadata),
            library,
            config: Arc::new(config),
            paths: Arc::new(paths),
            object_store,
            jobs,
            scan_status: Arc::new(RwLock::new(ScanStatus::Idle)),
            watcher: Arc::new(RwLock::new(None)),
        }
    }
}
