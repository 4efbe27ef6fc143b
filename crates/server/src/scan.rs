use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{is_video_file, MediaType, StorageLocator};
use library::{walk_media_files, InsertOutcome, Library, LibraryError, NewMedia};
use metadata::parse_file_name;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::external::{placeholder_overview, placeholder_poster, LookupRequest, MetadataResolver};
use crate::jobs::Job;
use crate::object_store::ObjectStore;
use crate::state::{AppState, ScanStatus};

#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    pub message: String,
    pub added: usize,
    #[serde(skip)]
    pub added_ids: Vec<String>,
}

#[derive(Debug)]
pub enum ScanError {
    Library(LibraryError),
    Join(String),
    InProgress,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Library(err) => write!(f, "{}", err),
            ScanError::Join(message) => write!(f, "scan task failed: {}", message),
            ScanError::InProgress => write!(f, "a scan is already running"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<LibraryError> for ScanError {
    fn from(err: LibraryError) -> Self {
        ScanError::Library(err)
    }
}

/// Registers every video found in the local media root and the configured
/// buckets. A source that cannot be read is reported and skipped; only
/// persistence failures abort the scan.
#[derive(Clone)]
pub struct LibraryScanner {
    library: Library,
    local_root: Option<PathBuf>,
    object_store: Option<Arc<dyn ObjectStore>>,
    buckets: Vec<String>,
    excluded_dirs: Vec<PathBuf>,
}

impl LibraryScanner {
    pub fn new(
        library: Library,
        local_root: Option<PathBuf>,
        object_store: Option<Arc<dyn ObjectStore>>,
        buckets: Vec<String>,
    ) -> Self {
        Self {
            library,
            local_root,
            object_store,
            buckets,
            excluded_dirs: Vec::new(),
        }
    }

    /// Generated files (renditions, subtitles) may live under the media root
    /// and must not be registered as media of their own.
    pub fn exclude_dirs(mut self, dirs: &[PathBuf]) -> Self {
        self.excluded_dirs = dirs
            .iter()
            .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
            .collect();
        self
    }

    pub async fn scan(&self) -> Result<ScanReport, ScanError> {
        let mut messages = Vec::new();
        let mut added_ids = Vec::new();

        match &self.local_root {
            None => messages.push("local: media directory not configured, skipped".to_string()),
            Some(root) if !root.is_dir() => {
                info!("Media directory {} not found", root.display());
                messages.push("local: media directory not found, skipped".to_string());
            }
            Some(root) => {
                let library = self.library.clone();
                let root = root.clone();
                let excluded = self.excluded_dirs.clone();
                let ids = tokio::task::spawn_blocking(move || {
                    scan_local(&library, &root, &excluded)
                })
                .await
                .map_err(|err| ScanError::Join(err.to_string()))??;
                messages.push(format!("local: {} added", ids.len()));
                added_ids.extend(ids);
            }
        }

        match &self.object_store {
            None if self.buckets.is_empty() => {}
            None => messages.push("remote: object store not configured, skipped".to_string()),
            Some(store) => {
                for bucket in &self.buckets {
                    let entries = match store.list_all(bucket).await {
                        Ok(entries) => entries,
                        Err(err) => {
                            warn!("Listing bucket '{}' failed: {}", bucket, err);
                            messages.push(format!("remote bucket '{}': unavailable, skipped", bucket));
                            continue;
                        }
                    };
                    let keys: Vec<String> = entries.into_iter().map(|entry| entry.key).collect();
                    let library = self.library.clone();
                    let bucket_name = bucket.clone();
                    let ids = tokio::task::spawn_blocking(move || {
                        scan_bucket(&library, &bucket_name, &keys)
                    })
                    .await
                    .map_err(|err| ScanError::Join(err.to_string()))??;
                    messages.push(format!("remote bucket '{}': {} added", bucket, ids.len()));
                    added_ids.extend(ids);
                }
            }
        }

        let report = ScanReport {
            message: messages.join("; "),
            added: added_ids.len(),
            added_ids,
        };
        info!("Scan finished: {}", report.message);
        Ok(report)
    }
}

fn scan_local(
    library: &Library,
    root: &Path,
    excluded: &[PathBuf],
) -> Result<Vec<String>, LibraryError> {
    let mut added = Vec::new();
    for path in walk_media_files(root) {
        if !is_video_file(&path) || excluded.iter().any(|dir| path.starts_with(dir)) {
            continue;
        }
        let file_name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let storage_path = path.to_string_lossy().into_owned();
        if let Some(id) = register_file(library, storage_path, &file_name)? {
            added.push(id);
        }
    }
    Ok(added)
}

fn scan_bucket(
    library: &Library,
    bucket: &str,
    keys: &[String],
) -> Result<Vec<String>, LibraryError> {
    let mut added = Vec::new();
    for key in keys {
        if key.ends_with('/') || !is_video_file(Path::new(key)) {
            continue;
        }
        let file_name = key.rsplit('/').next().unwrap_or(key.as_str());
        let storage_path = StorageLocator::remote_path(bucket, key);
        if let Some(id) = register_file(library, storage_path, file_name)? {
            added.push(id);
        }
    }
    Ok(added)
}

/// Returns the new id, or `None` when the path is already in the library.
pub fn register_file(
    library: &Library,
    storage_path: String,
    file_name: &str,
) -> Result<Option<String>, LibraryError> {
    let parsed = parse_file_name(file_name);
    let draft = NewMedia {
        poster_url: Some(placeholder_poster(&parsed.title)),
        overview: Some(placeholder_overview(file_name)),
        title: parsed.title,
        year: parsed.year,
        media_type: MediaType::Movie,
        storage_path,
        original_file_name: Some(file_name.to_string()),
        backdrop_url: None,
        needs_transcode: false,
    };
    match library.insert_media_if_absent(draft)? {
        InsertOutcome::Inserted(record) => {
            debug!("Registered {} as '{}'", record.storage_path, record.title);
            Ok(Some(record.id))
        }
        InsertOutcome::AlreadyExists(_) => Ok(None),
    }
}

pub fn scanner_for(state: &AppState) -> LibraryScanner {
    LibraryScanner::new(
        state.library.clone(),
        state.paths.media_root.clone(),
        state.object_store.clone(),
        state.config.object_store.buckets.clone(),
    )
    .exclude_dirs(&[
        state.paths.renditions_dir.clone(),
        state.paths.subtitles_dir.clone(),
    ])
}

/// Runs one scan, tracking it in the shared status. Refuses to start while
/// another scan is running.
pub async fn run_scan(state: &AppState) -> Result<ScanReport, ScanError> {
    {
        let mut status = state.scan_status.write();
        if matches!(*status, ScanStatus::Scanning { .. }) {
            return Err(ScanError::InProgress);
        }
        *status = ScanStatus::Scanning {
            started: SystemTime::now(),
        };
    }

    let result = scanner_for(state).scan().await;
    match &result {
        Ok(report) => {
            *state.scan_status.write() = ScanStatus::Ready {
                report: report.clone(),
                finished: SystemTime::now(),
            };
            if state.config.metadata.enrich_on_scan && !report.added_ids.is_empty() {
                let queued = queue_enrichment(state, &report.added_ids, false);
                if queued > 0 {
                    info!("Queued metadata enrichment for {} new items", queued);
                }
            }
        }
        Err(err) => {
            warn!("Library scan failed: {}", err);
            *state.scan_status.write() = ScanStatus::Error(err.to_string());
        }
    }
    result
}

/// Enqueues Enrich jobs for `candidates`, honoring the provider throttle and
/// the configured per-sweep limit. Returns how many were queued.
pub fn queue_enrichment(state: &AppState, candidates: &[String], replace: bool) -> usize {
    if !state.resolver.is_enabled() {
        debug!("Metadata enrichment skipped (provider not configured)");
        return 0;
    }
    let limit = state.config.metadata.scan_limit;
    let min_interval = Duration::from_secs(state.config.metadata.min_interval_secs);
    let mut queued = 0usize;
    for media_id in candidates {
        if queued >= limit {
            break;
        }
        match state
            .library
            .should_attempt_external(&enrichment_key(media_id), min_interval)
        {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!("Metadata throttle check failed: {}", err);
                continue;
            }
        }
        let job = Job::Enrich {
            media_id: media_id.clone(),
            replace,
        };
        match state.jobs.enqueue(job) {
            Ok(_) => queued += 1,
            Err(err) => warn!("Failed to queue enrichment for {}: {}", media_id, err),
        }
    }
    queued
}

pub fn enrichment_key(media_id: &str) -> String {
    format!("media:{}", media_id)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchResult {
    pub attempted: bool,
    pub updated: bool,
}

impl FetchResult {
    fn skipped() -> Self {
        Self {
            attempted: false,
            updated: false,
        }
    }

    fn attempted(updated: bool) -> Self {
        Self {
            attempted: true,
            updated,
        }
    }
}

/// Looks a record up with the metadata provider and applies the result.
/// `None` when the record does not exist.
pub async fn enrich_media(
    library: &Library,
    resolver: &MetadataResolver,
    media_id: &str,
    replace: bool,
) -> Result<Option<FetchResult>, LibraryError> {
    let record = match library.get_media(media_id)? {
        Some(record) => record,
        None => return Ok(None),
    };
    if !resolver.is_enabled() {
        return Ok(Some(FetchResult::skipped()));
    }
    let key = enrichment_key(media_id);
    library.record_external_attempt(&key, false)?;
    info!("Fetching metadata for '{}'", record.title);
    let bundle = resolver
        .resolve(&LookupRequest {
            title: &record.title,
            year: record.year,
            external_id: record.external_id.as_deref(),
            kind: record.media_type,
            file_name: record.original_file_name.as_deref(),
        })
        .await;
    if bundle.placeholder {
        return Ok(Some(FetchResult::attempted(false)));
    }
    let updated = library.apply_enrichment(media_id, &bundle, replace)?;
    library.record_external_attempt(&key, true)?;
    Ok(Some(FetchResult::attempted(updated)))
}
