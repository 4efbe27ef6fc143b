use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{
    EpisodeRecord, MediaRecord, MediaType, MetadataBundle, SubtitleRecord, TranscodeState,
};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

mod user_data;
mod walk;

pub use walk::{walk_media_files, MediaWalk};

const KEY_SEP: char = '\x1f';
const EMPTY_VALUE: &[u8] = &[];

const MEDIA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media");
const MEDIA_BY_PATH_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media_by_path");
const MEDIA_BY_TITLE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media_by_title");
const EPISODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("episodes");
const EPISODES_BY_PATH_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("episodes_by_path");
const MEDIA_EPISODES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("media_episodes");
const SUBTITLES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("subtitles");
const MEDIA_SUBTITLES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("media_subtitles");
const WATCH_PROGRESS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("watch_progress");
const FAVORITES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("favorites");
const EXTERNAL_ATTEMPTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("external_attempts");

/// Fields needed to create a media record; ids and timestamps are assigned here.
#[derive(Clone, Debug)]
pub struct NewMedia {
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub media_type: MediaType,
    pub storage_path: String,
    pub original_file_name: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub needs_transcode: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MediaPatch {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub media_type: Option<MediaType>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub genres: Option<Vec<String>>,
}

#[derive(Clone, Debug)]
pub enum InsertOutcome {
    Inserted(MediaRecord),
    AlreadyExists(String),
}

#[derive(Clone, Debug)]
pub struct NewEpisode {
    pub media_id: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub title: String,
    pub overview: Option<String>,
    pub still_url: Option<String>,
    pub storage_path: String,
}

#[derive(Clone, Debug)]
pub enum EpisodeInsert {
    Inserted(EpisodeRecord),
    MissingMedia,
    DuplicatePath(String),
    DuplicateNumber(String),
}

#[derive(Clone)]
pub struct Library {
    db: Arc<Database>,
}

impl Library {
    pub fn open(db_path: &Path) -> Result<Self, LibraryError> {
        let db = Self::open_db(db_path)?;
        let library = Self::with_db(db)?;
        info!("Opened library index at {:?}", db_path);
        Ok(library)
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, LibraryError> {
        let db = open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self, LibraryError> {
        let library = Self { db };
        library.init_tables()?;
        Ok(library)
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        for table in [
            MEDIA_TABLE,
            MEDIA_BY_PATH_TABLE,
            MEDIA_BY_TITLE_TABLE,
            EPISODES_TABLE,
            EPISODES_BY_PATH_TABLE,
            MEDIA_EPISODES_TABLE,
            SUBTITLES_TABLE,
            MEDIA_SUBTITLES_TABLE,
            WATCH_PROGRESS_TABLE,
            FAVORITES_TABLE,
            EXTERNAL_ATTEMPTS_TABLE,
        ] {
            let _ = write_txn.open_table(table)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Creates a record unless one already owns `storage_path`. The lookup and
    /// the insert share one write transaction, so concurrent callers racing on
    /// the same path see exactly one `Inserted`.
    pub fn insert_media_if_absent(&self, draft: NewMedia) -> Result<InsertOutcome, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut by_path = write_txn.open_table(MEDIA_BY_PATH_TABLE)?;
            if let Some(existing) = by_path.get(draft.storage_path.as_str())? {
                let id = String::from_utf8_lossy(existing.value()).to_string();
                return Ok(InsertOutcome::AlreadyExists(id));
            }

            let now = now_secs();
            let record = MediaRecord {
                id: Uuid::new_v4().to_string(),
                title: draft.title,
                year: draft.year,
                overview: draft.overview,
                media_type: draft.media_type,
                storage_path: draft.storage_path,
                original_file_name: draft.original_file_name,
                poster_url: draft.poster_url,
                backdrop_url: draft.backdrop_url,
                genres: Vec::new(),
                cast: Vec::new(),
                tmdb_id: None,
                external_id: None,
                renditions: BTreeMap::new(),
                needs_transcode: draft.needs_transcode,
                transcode_state: TranscodeState::NotStarted,
                created_at: now,
                updated_at: now,
            };

            by_path.insert(record.storage_path.as_str(), record.id.as_bytes())?;
            let mut media_table = write_txn.open_table(MEDIA_TABLE)?;
            let bytes = encode_value(&record)?;
            media_table.insert(record.id.as_str(), bytes.as_slice())?;
            let mut by_title = write_txn.open_table(MEDIA_BY_TITLE_TABLE)?;
            by_title.insert(title_key(&record.title, &record.id).as_str(), EMPTY_VALUE)?;
            record
        };
        write_txn.commit()?;
        Ok(InsertOutcome::Inserted(record))
    }

    pub fn get_media(&self, media_id: &str) -> Result<Option<MediaRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(MEDIA_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = match table.get(media_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(record)
    }

    pub fn find_media_by_path(
        &self,
        storage_path: &str,
    ) -> Result<Option<MediaRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let by_path = read_txn.open_table(MEDIA_BY_PATH_TABLE)?;
        let media_id = match by_path.get(storage_path)? {
            Some(value) => String::from_utf8_lossy(value.value()).to_string(),
            None => return Ok(None),
        };
        let media_table = read_txn.open_table(MEDIA_TABLE)?;
        let record = match media_table.get(media_id.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Title-ordered page of records, optionally filtered by a case-insensitive
    /// substring of the title. Returns the page and the filtered total.
    pub fn list_media(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<MediaRecord>, usize), LibraryError> {
        let search = search
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_lowercase());

        let read_txn = self.db.begin_read()?;
        let by_title = match read_txn.open_table(MEDIA_BY_TITLE_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok((Vec::new(), 0)),
            Err(err) => return Err(err.into()),
        };
        let media_table = read_txn.open_table(MEDIA_TABLE)?;

        let mut total = 0usize;
        let mut items = Vec::new();
        for entry in by_title.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            let (title_lower, media_id) = split_key_last(key)?;
            if let Some(search) = &search {
                if !title_lower.contains(search.as_str()) {
                    continue;
                }
            }

            total += 1;
            if total <= offset || items.len() >= limit {
                continue;
            }
            if let Some(value) = media_table.get(media_id)? {
                let record: MediaRecord = decode_value(value.value())?;
                items.push(record);
            }
        }
        Ok((items, total))
    }

    pub fn count_media(&self) -> Result<usize, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(MEDIA_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        Ok(table.len()? as usize)
    }

    /// Ids of records still carrying placeholder metadata (no provider id).
    /// Every record the provider never matched. Callers cap how many they act
    /// on, after their own throttling.
    pub fn list_unenriched_media(&self) -> Result<Vec<String>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MEDIA_TABLE)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let record: MediaRecord = decode_value(entry.1.value())?;
            if record.tmdb_id.is_none() {
                ids.push(record.id);
            }
        }
        Ok(ids)
    }

    pub fn update_media(
        &self,
        media_id: &str,
        patch: MediaPatch,
    ) -> Result<Option<MediaRecord>, LibraryError> {
        self.modify_media(media_id, |record| {
            if let Some(title) = patch.title.filter(|title| !title.trim().is_empty()) {
                record.title = title.trim().to_string();
            }
            if patch.year.is_some() {
                record.year = patch.year;
            }
            if patch.overview.is_some() {
                record.overview = patch.overview;
            }
            if let Some(media_type) = patch.media_type {
                record.media_type = media_type;
            }
            if patch.poster_url.is_some() {
                record.poster_url = patch.poster_url;
            }
            if patch.backdrop_url.is_some() {
                record.backdrop_url = patch.backdrop_url;
            }
            if let Some(genres) = patch.genres {
                record.genres = Vec::new();
                merge_genres(&mut record.genres, &genres);
            }
            true
        })
    }

    /// Removes the record and everything owned by it: episodes, subtitles,
    /// favorites and watch progress, all in one transaction.
    pub fn delete_media(&self, media_id: &str) -> Result<Option<DeletedMedia>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut media_table = write_txn.open_table(MEDIA_TABLE)?;
            let record: MediaRecord = match media_table.remove(media_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(None),
            };

            let mut by_path = write_txn.open_table(MEDIA_BY_PATH_TABLE)?;
            by_path.remove(record.storage_path.as_str())?;
            let mut by_title = write_txn.open_table(MEDIA_BY_TITLE_TABLE)?;
            by_title.remove(title_key(&record.title, &record.id).as_str())?;

            let episodes = remove_media_episodes(&write_txn, media_id)?;
            let subtitles = remove_media_subtitles(&write_txn, media_id)?;
            remove_user_rows(&write_txn, WATCH_PROGRESS_TABLE, media_id)?;
            remove_user_rows(&write_txn, FAVORITES_TABLE, media_id)?;

            DeletedMedia {
                record,
                episodes,
                subtitles,
            }
        };
        write_txn.commit()?;
        Ok(Some(deleted))
    }

    /// Marks a transcode transition. Any state past `NotStarted` implies the
    /// record now depends on renditions for readiness.
    pub fn set_transcode_state(
        &self,
        media_id: &str,
        state: TranscodeState,
    ) -> Result<Option<MediaRecord>, LibraryError> {
        self.modify_media(media_id, |record| {
            if state != TranscodeState::NotStarted {
                record.needs_transcode = true;
            }
            if record.transcode_state == state {
                return false;
            }
            record.transcode_state = state;
            true
        })
    }

    pub fn add_rendition(
        &self,
        media_id: &str,
        label: &str,
        url: &str,
    ) -> Result<Option<MediaRecord>, LibraryError> {
        self.modify_media(media_id, |record| {
            if record.renditions.get(label).map(String::as_str) == Some(url) {
                return false;
            }
            record.renditions.insert(label.to_string(), url.to_string());
            true
        })
    }

    /// Applies a lookup result. Without `replace`, only empty fields and
    /// placeholder artwork are filled; with it, provider-owned fields are
    /// overwritten. Placeholder bundles never overwrite anything.
    pub fn apply_enrichment(
        &self,
        media_id: &str,
        bundle: &MetadataBundle,
        replace: bool,
    ) -> Result<bool, LibraryError> {
        if bundle.placeholder {
            return Ok(false);
        }
        let write_txn = self.db.begin_write()?;
        let updated = {
            let mut media_table = write_txn.open_table(MEDIA_TABLE)?;
            let mut record: MediaRecord = match media_table.get(media_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(false),
            };
            let old_title = record.title.clone();

            let mut updated = false;
            if replace && !bundle.title.trim().is_empty() && record.title != bundle.title {
                record.title = bundle.title.trim().to_string();
                updated = true;
            }
            if bundle.year.is_some() && (replace || record.year.is_none()) && record.year != bundle.year
            {
                record.year = bundle.year;
                updated = true;
            }
            if let Some(overview) = bundle.overview.as_deref().and_then(clean_text) {
                let should_update = replace
                    || record
                        .overview
                        .as_deref()
                        .map(|value| value.trim().is_empty() || is_placeholder_overview(value))
                        .unwrap_or(true);
                if should_update && record.overview.as_deref() != Some(overview.as_str()) {
                    record.overview = Some(overview);
                    updated = true;
                }
            }
            if let Some(poster) = &bundle.poster_url {
                let should_update = replace
                    || record
                        .poster_url
                        .as_deref()
                        .map(is_placeholder_image)
                        .unwrap_or(true);
                if should_update && record.poster_url.as_deref() != Some(poster.as_str()) {
                    record.poster_url = Some(poster.clone());
                    updated = true;
                }
            }
            if let Some(backdrop) = &bundle.backdrop_url {
                if (replace || record.backdrop_url.is_none())
                    && record.backdrop_url.as_deref() != Some(backdrop.as_str())
                {
                    record.backdrop_url = Some(backdrop.clone());
                    updated = true;
                }
            }
            if !bundle.genres.is_empty() {
                if replace {
                    let mut normalized = Vec::new();
                    merge_genres(&mut normalized, &bundle.genres);
                    if record.genres != normalized {
                        record.genres = normalized;
                        updated = true;
                    }
                } else {
                    let before = record.genres.len();
                    merge_genres(&mut record.genres, &bundle.genres);
                    if record.genres.len() != before {
                        updated = true;
                    }
                }
            }
            if !bundle.cast.is_empty() && (replace || record.cast.is_empty()) && record.cast != bundle.cast
            {
                record.cast = bundle.cast.clone();
                updated = true;
            }
            if bundle.tmdb_id.is_some() && record.tmdb_id != bundle.tmdb_id {
                record.tmdb_id = bundle.tmdb_id;
                updated = true;
            }

            if updated {
                record.updated_at = now_secs();
                let bytes = encode_value(&record)?;
                media_table.insert(media_id, bytes.as_slice())?;
                if record.title != old_title {
                    let mut by_title = write_txn.open_table(MEDIA_BY_TITLE_TABLE)?;
                    by_title.remove(title_key(&old_title, media_id).as_str())?;
                    by_title.insert(title_key(&record.title, media_id).as_str(), EMPTY_VALUE)?;
                }
            }
            updated
        };

        if updated {
            write_txn.commit()?;
        }
        Ok(updated)
    }

    pub fn create_episode(&self, draft: NewEpisode) -> Result<EpisodeInsert, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let media_table = write_txn.open_table(MEDIA_TABLE)?;
            if media_table.get(draft.media_id.as_str())?.is_none() {
                return Ok(EpisodeInsert::MissingMedia);
            }

            let mut by_path = write_txn.open_table(EPISODES_BY_PATH_TABLE)?;
            if let Some(existing) = by_path.get(draft.storage_path.as_str())? {
                let id = String::from_utf8_lossy(existing.value()).to_string();
                return Ok(EpisodeInsert::DuplicatePath(id));
            }
            let mut media_episodes = write_txn.open_table(MEDIA_EPISODES_TABLE)?;
            let number_key =
                episode_key(&draft.media_id, draft.season_number, draft.episode_number);
            if let Some(existing) = media_episodes.get(number_key.as_str())? {
                let id = String::from_utf8_lossy(existing.value()).to_string();
                return Ok(EpisodeInsert::DuplicateNumber(id));
            }

            let now = now_secs();
            let record = EpisodeRecord {
                id: Uuid::new_v4().to_string(),
                media_id: draft.media_id,
                season_number: draft.season_number,
                episode_number: draft.episode_number,
                title: draft.title,
                overview: draft.overview,
                still_url: draft.still_url,
                storage_path: draft.storage_path,
                renditions: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            };
            by_path.insert(record.storage_path.as_str(), record.id.as_bytes())?;
            media_episodes.insert(number_key.as_str(), record.id.as_bytes())?;
            let mut episodes = write_txn.open_table(EPISODES_TABLE)?;
            let bytes = encode_value(&record)?;
            episodes.insert(record.id.as_str(), bytes.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(EpisodeInsert::Inserted(record))
    }

    pub fn get_episode(&self, episode_id: &str) -> Result<Option<EpisodeRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(EPISODES_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record = match table.get(episode_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Episodes of one media record ordered by season then episode number.
    pub fn list_episodes(&self, media_id: &str) -> Result<Vec<EpisodeRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let media_episodes = read_txn.open_table(MEDIA_EPISODES_TABLE)?;
        let episodes = read_txn.open_table(EPISODES_TABLE)?;

        let prefix = prefix_key(media_id);
        let mut end = prefix.clone();
        end.push('\u{10ffff}');
        let mut items = Vec::new();
        for entry in media_episodes.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let episode_id = String::from_utf8_lossy(entry.1.value()).to_string();
            if let Some(value) = episodes.get(episode_id.as_str())? {
                let record: EpisodeRecord = decode_value(value.value())?;
                items.push(record);
            }
        }
        Ok(items)
    }

    pub fn add_subtitle(
        &self,
        media_id: &str,
        language: &str,
        label: &str,
        url: &str,
    ) -> Result<Option<SubtitleRecord>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let media_table = write_txn.open_table(MEDIA_TABLE)?;
            if media_table.get(media_id)?.is_none() {
                return Ok(None);
            }
            let record = SubtitleRecord {
                id: Uuid::new_v4().to_string(),
                media_id: media_id.to_string(),
                language: language.to_string(),
                label: label.to_string(),
                url: url.to_string(),
                created_at: now_secs(),
            };
            let mut subtitles = write_txn.open_table(SUBTITLES_TABLE)?;
            let bytes = encode_value(&record)?;
            subtitles.insert(record.id.as_str(), bytes.as_slice())?;
            let mut media_subtitles = write_txn.open_table(MEDIA_SUBTITLES_TABLE)?;
            media_subtitles.insert(join_key(media_id, &record.id).as_str(), EMPTY_VALUE)?;
            record
        };
        write_txn.commit()?;
        Ok(Some(record))
    }

    pub fn list_subtitles(&self, media_id: &str) -> Result<Vec<SubtitleRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let media_subtitles = read_txn.open_table(MEDIA_SUBTITLES_TABLE)?;
        let subtitles = read_txn.open_table(SUBTITLES_TABLE)?;

        let prefix = prefix_key(media_id);
        let mut end = prefix.clone();
        end.push('\u{10ffff}');
        let mut items = Vec::new();
        for entry in media_subtitles.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let (_, subtitle_id) = split_key_last(entry.0.value())?;
            if let Some(value) = subtitles.get(subtitle_id)? {
                let record: SubtitleRecord = decode_value(value.value())?;
                items.push(record);
            }
        }
        items.sort_by_key(|record| record.created_at);
        Ok(items)
    }

    pub fn delete_subtitle(
        &self,
        subtitle_id: &str,
    ) -> Result<Option<SubtitleRecord>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut subtitles = write_txn.open_table(SUBTITLES_TABLE)?;
            let record: SubtitleRecord = match subtitles.remove(subtitle_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(None),
            };
            let mut media_subtitles = write_txn.open_table(MEDIA_SUBTITLES_TABLE)?;
            media_subtitles.remove(join_key(&record.media_id, &record.id).as_str())?;
            record
        };
        write_txn.commit()?;
        Ok(Some(record))
    }

    pub fn should_attempt_external(
        &self,
        key: &str,
        min_interval: Duration,
    ) -> Result<bool, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(EXTERNAL_ATTEMPTS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let attempt = match table.get(key)? {
            Some(value) => decode_value::<ExternalAttempt>(value.value())?,
            None => return Ok(true),
        };
        let now = now_secs();
        Ok(now.saturating_sub(attempt.last_attempt) >= min_interval.as_secs())
    }

    pub fn record_external_attempt(&self, key: &str, success: bool) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EXTERNAL_ATTEMPTS_TABLE)?;
            let now = now_secs();
            let mut record = match table.get(key)? {
                Some(value) => decode_value::<ExternalAttempt>(value.value())?,
                None => ExternalAttempt {
                    last_attempt: now,
                    last_success: None,
                },
            };
            record.last_attempt = now;
            if success {
                record.last_success = Some(now);
            }
            let bytes = encode_value(&record)?;
            table.insert(key, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn db(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    fn modify_media<F>(&self, media_id: &str, apply: F) -> Result<Option<MediaRecord>, LibraryError>
    where
        F: FnOnce(&mut MediaRecord) -> bool,
    {
        let write_txn = self.db.begin_write()?;
        let (record, changed) = {
            let mut media_table = write_txn.open_table(MEDIA_TABLE)?;
            let mut record: MediaRecord = match media_table.get(media_id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(None),
            };
            let old_title = record.title.clone();
            let changed = apply(&mut record);
            if changed {
                record.updated_at = now_secs();
                let bytes = encode_value(&record)?;
                media_table.insert(media_id, bytes.as_slice())?;
                if record.title != old_title {
                    let mut by_title = write_txn.open_table(MEDIA_BY_TITLE_TABLE)?;
                    by_title.remove(title_key(&old_title, media_id).as_str())?;
                    by_title.insert(title_key(&record.title, media_id).as_str(), EMPTY_VALUE)?;
                }
            }
            (record, changed)
        };
        if changed {
            write_txn.commit()?;
        }
        Ok(Some(record))
    }
}

/// What a cascade delete removed, so callers can clean up files on disk.
#[derive(Clone, Debug)]
pub struct DeletedMedia {
    pub record: MediaRecord,
    pub episodes: Vec<EpisodeRecord>,
    pub subtitles: Vec<SubtitleRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ExternalAttempt {
    last_attempt: u64,
    last_success: Option<u64>,
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn remove_media_episodes(
    txn: &WriteTransaction,
    media_id: &str,
) -> Result<Vec<EpisodeRecord>, LibraryError> {
    let mut media_episodes = txn.open_table(MEDIA_EPISODES_TABLE)?;
    let prefix = prefix_key(media_id);
    let mut end = prefix.clone();
    end.push('\u{10ffff}');
    let mut keys = Vec::new();
    for entry in media_episodes.range(prefix.as_str()..end.as_str())? {
        let entry = entry?;
        keys.push((
            entry.0.value().to_string(),
            String::from_utf8_lossy(entry.1.value()).to_string(),
        ));
    }

    let mut episodes = txn.open_table(EPISODES_TABLE)?;
    let mut by_path = txn.open_table(EPISODES_BY_PATH_TABLE)?;
    let mut removed = Vec::new();
    for (key, episode_id) in keys {
        media_episodes.remove(key.as_str())?;
        let record: Option<EpisodeRecord> = match episodes.remove(episode_id.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        if let Some(record) = record {
            by_path.remove(record.storage_path.as_str())?;
            removed.push(record);
        }
    }
    Ok(removed)
}

fn remove_media_subtitles(
    txn: &WriteTransaction,
    media_id: &str,
) -> Result<Vec<SubtitleRecord>, LibraryError> {
    let mut media_subtitles = txn.open_table(MEDIA_SUBTITLES_TABLE)?;
    let prefix = prefix_key(media_id);
    let mut end = prefix.clone();
    end.push('\u{10ffff}');
    let mut keys = Vec::new();
    for entry in media_subtitles.range(prefix.as_str()..end.as_str())? {
        let entry = entry?;
        keys.push(entry.0.value().to_string());
    }

    let mut subtitles = txn.open_table(SUBTITLES_TABLE)?;
    let mut removed = Vec::new();
    for key in keys {
        media_subtitles.remove(key.as_str())?;
        let (_, subtitle_id) = split_key_last(&key)?;
        let record: Option<SubtitleRecord> = match subtitles.remove(subtitle_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        if let Some(record) = record {
            removed.push(record);
        }
    }
    Ok(removed)
}

/// Drops every `user SEP media` row pointing at `media_id`.
fn remove_user_rows(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
    media_id: &str,
) -> Result<(), LibraryError> {
    let mut table = txn.open_table(table)?;
    let mut keys = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        let key = entry.0.value();
        let (_, row_media) = split_key_last(key)?;
        if row_media == media_id {
            keys.push(key.to_string());
        }
    }
    for key in keys {
        table.remove(key.as_str())?;
    }
    Ok(())
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn join_key(first: &str, second: &str) -> String {
    let mut out = prefix_key(first);
    out.push_str(second);
    out
}

fn title_key(title: &str, media_id: &str) -> String {
    join_key(&title.to_lowercase(), media_id)
}

fn episode_key(media_id: &str, season: u32, episode: u32) -> String {
    join_key(media_id, &format!("{:04}:{:04}", season, episode))
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

fn clean_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn merge_genres(target: &mut Vec<String>, incoming: &[String]) {
    for genre in incoming {
        let genre = genre.trim();
        if genre.is_empty() {
            continue;
        }
        if !target
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(genre))
        {
            target.push(genre.to_string());
        }
    }
}

pub const PLACEHOLDER_IMAGE_HOST: &str = "placehold.co";
pub const PLACEHOLDER_OVERVIEW_PREFIX: &str = "Auto-detected from file: ";

fn is_placeholder_image(url: &str) -> bool {
    url.trim().is_empty() || url.contains(PLACEHOLDER_IMAGE_HOST)
}

fn is_placeholder_overview(value: &str) -> bool {
    value.starts_with(PLACEHOLDER_OVERVIEW_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn open_library(dir: &tempfile::TempDir) -> Library {
        Library::open(&dir.path().join("index.redb")).unwrap()
    }

    fn draft(path: &str, title: &str) -> NewMedia {
        NewMedia {
            title: title.to_string(),
            year: None,
            overview: Some(format!("{}{}", PLACEHOLDER_OVERVIEW_PREFIX, title)),
            media_type: MediaType::Movie,
            storage_path: path.to_string(),
            original_file_name: None,
            poster_url: Some("https://placehold.co/400x600/1a1a1a/ffffff?text=x".to_string()),
            backdrop_url: None,
            needs_transcode: false,
        }
    }

    fn inserted(outcome: InsertOutcome) -> MediaRecord {
        match outcome {
            InsertOutcome::Inserted(record) => record,
            InsertOutcome::AlreadyExists(id) => panic!("unexpected duplicate {}", id),
        }
    }

    #[test]
    fn second_insert_for_same_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);

        let first = inserted(
            library
                .insert_media_if_absent(draft("store:films:heat.mkv", "Heat"))
                .unwrap(),
        );
        match library
            .insert_media_if_absent(draft("store:films:heat.mkv", "Heat again"))
            .unwrap()
        {
            InsertOutcome::AlreadyExists(id) => assert_eq!(id, first.id),
            InsertOutcome::Inserted(_) => panic!("duplicate path inserted"),
        }
        assert_eq!(library.count_media().unwrap(), 1);
        let found = library.find_media_by_path("store:films:heat.mkv").unwrap();
        assert_eq!(found.map(|record| record.title), Some("Heat".to_string()));
    }

    #[test]
    fn concurrent_inserts_create_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let library = library.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    matches!(
                        library
                            .insert_media_if_absent(draft("/media/Ronin (1998).mkv", "Ronin"))
                            .unwrap(),
                        InsertOutcome::Inserted(_)
                    )
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(library.count_media().unwrap(), 1);
    }

    #[test]
    fn list_media_is_title_ordered_and_searchable() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        for (path, title) in [("/m/c.mkv", "Casino"), ("/m/a.mkv", "Alien"), ("/m/b.mkv", "Aliens")] {
            library.insert_media_if_absent(draft(path, title)).unwrap();
        }

        let (all, total) = library.list_media(None, 10, 0).unwrap();
        assert_eq!(total, 3);
        let titles: Vec<_> = all.iter().map(|record| record.title.as_str()).collect();
        assert_eq!(titles, vec!["Alien", "Aliens", "Casino"]);

        let (found, total) = library.list_media(Some("ALIEN"), 1, 1).unwrap();
        assert_eq!(total, 2);
        assert_eq!(found[0].title, "Aliens");
    }

    #[test]
    fn delete_cascades_to_owned_rows() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        let media = inserted(
            library
                .insert_media_if_absent(draft("/m/show.mkv", "Show"))
                .unwrap(),
        );
        let episode = match library
            .create_episode(NewEpisode {
                media_id: media.id.clone(),
                season_number: 1,
                episode_number: 1,
                title: "Pilot".to_string(),
                overview: None,
                still_url: None,
                storage_path: "/m/show/s01e01.mkv".to_string(),
            })
            .unwrap()
        {
            EpisodeInsert::Inserted(record) => record,
            other => panic!("unexpected {:?}", other),
        };
        library
            .add_subtitle(&media.id, "en", "English", "/files/subtitles/a.vtt")
            .unwrap();
        library.set_progress("alice", &media.id, 120).unwrap();
        library.add_favorite("alice", &media.id).unwrap();

        let deleted = library.delete_media(&media.id).unwrap().unwrap();
        assert_eq!(deleted.episodes.len(), 1);
        assert_eq!(deleted.subtitles.len(), 1);

        assert!(library.get_media(&media.id).unwrap().is_none());
        assert!(library.get_episode(&episode.id).unwrap().is_none());
        assert!(library.list_subtitles(&media.id).unwrap().is_empty());
        assert!(library.get_progress("alice", &media.id).unwrap().is_none());
        assert!(library.list_favorites("alice").unwrap().is_empty());
        assert!(library.find_media_by_path("/m/show.mkv").unwrap().is_none());

        // path is free again after delete
        inserted(
            library
                .insert_media_if_absent(draft("/m/show.mkv", "Show"))
                .unwrap(),
        );
    }

    #[test]
    fn duplicate_episode_number_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        let media = inserted(library.insert_media_if_absent(draft("/m/s.mkv", "S")).unwrap());
        let episode = |path: &str| NewEpisode {
            media_id: media.id.clone(),
            season_number: 2,
            episode_number: 5,
            title: "E5".to_string(),
            overview: None,
            still_url: None,
            storage_path: path.to_string(),
        };

        assert!(matches!(
            library.create_episode(episode("/m/s/a.mkv")).unwrap(),
            EpisodeInsert::Inserted(_)
        ));
        assert!(matches!(
            library.create_episode(episode("/m/s/b.mkv")).unwrap(),
            EpisodeInsert::DuplicateNumber(_)
        ));
        assert!(matches!(
            library.create_episode(episode("/m/s/a.mkv")).unwrap(),
            EpisodeInsert::DuplicatePath(_)
        ));
        let mut orphan = episode("/m/s/c.mkv");
        orphan.media_id = "missing".to_string();
        assert!(matches!(
            library.create_episode(orphan).unwrap(),
            EpisodeInsert::MissingMedia
        ));
    }

    #[test]
    fn renditions_accumulate_and_state_tracks_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        let media = inserted(library.insert_media_if_absent(draft("/m/x.mkv", "X")).unwrap());

        let record = library
            .set_transcode_state(&media.id, TranscodeState::InProgress)
            .unwrap()
            .unwrap();
        assert!(record.needs_transcode);
        assert!(!record.processed());

        library
            .add_rendition(&media.id, "1080p", "/files/renditions/x_1080p.mp4")
            .unwrap();
        let record = library
            .add_rendition(&media.id, "480p", "/files/renditions/x_480p.mp4")
            .unwrap()
            .unwrap();
        assert_eq!(
            record.renditions.keys().cloned().collect::<Vec<_>>(),
            vec!["1080p".to_string(), "480p".to_string()]
        );

        let record = library
            .set_transcode_state(&media.id, TranscodeState::PartiallyComplete)
            .unwrap()
            .unwrap();
        assert!(record.processed());
    }

    #[test]
    fn enrichment_fills_placeholders_and_respects_replace() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        let media = inserted(
            library
                .insert_media_if_absent(draft("/m/heat.mkv", "heat"))
                .unwrap(),
        );
        let bundle = MetadataBundle {
            title: "Heat".to_string(),
            year: Some(1995),
            overview: Some("A group of thieves.".to_string()),
            poster_url: Some("https://image.tmdb.org/t/p/w500/heat.jpg".to_string()),
            backdrop_url: None,
            genres: vec!["Crime".to_string(), "crime".to_string()],
            cast: vec!["Al Pacino".to_string()],
            tmdb_id: Some(949),
            placeholder: false,
        };

        assert!(library.apply_enrichment(&media.id, &bundle, false).unwrap());
        let record = library.get_media(&media.id).unwrap().unwrap();
        assert_eq!(record.title, "heat");
        assert_eq!(record.year, Some(1995));
        assert_eq!(record.overview.as_deref(), Some("A group of thieves."));
        assert_eq!(
            record.poster_url.as_deref(),
            Some("https://image.tmdb.org/t/p/w500/heat.jpg")
        );
        assert_eq!(record.genres, vec!["Crime".to_string()]);
        assert_eq!(record.tmdb_id, Some(949));

        assert!(library.apply_enrichment(&media.id, &bundle, true).unwrap());
        let (found, _) = library.list_media(Some("Heat"), 10, 0).unwrap();
        assert_eq!(found[0].title, "Heat");

        let placeholder = MetadataBundle {
            placeholder: true,
            ..bundle
        };
        assert!(!library.apply_enrichment(&media.id, &placeholder, true).unwrap());
    }

    #[test]
    fn external_attempts_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let library = open_library(&dir);
        let interval = Duration::from_secs(3600);
        assert!(library.should_attempt_external("media:1", interval).unwrap());
        library.record_external_attempt("media:1", false).unwrap();
        assert!(!library.should_attempt_external("media:1", interval).unwrap());
        assert!(library
            .should_attempt_external("media:1", Duration::from_secs(0))
            .unwrap());
    }
}
