use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STORE_PREFIX: &str = "store:";

pub const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "avi", "mov", "webm"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Series,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    #[default]
    NotStarted,
    InProgress,
    PartiallyComplete,
    Complete,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub media_type: MediaType,
    pub storage_path: String,
    pub original_file_name: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub cast: Vec<String>,
    pub tmdb_id: Option<u64>,
    pub external_id: Option<String>,
    #[serde(default)]
    pub renditions: BTreeMap<String, String>,
    pub needs_transcode: bool,
    pub transcode_state: TranscodeState,
    pub created_at: u64,
    pub updated_at: u64,
}

impl MediaRecord {
    /// Readiness signal: nothing to transcode, or at least one rendition landed.
    pub fn processed(&self) -> bool {
        !self.needs_transcode
            || matches!(
                self.transcode_state,
                TranscodeState::PartiallyComplete | TranscodeState::Complete
            )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: String,
    pub media_id: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub title: String,
    pub overview: Option<String>,
    pub still_url: Option<String>,
    pub storage_path: String,
    #[serde(default)]
    pub renditions: BTreeMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtitleRecord {
    pub id: String,
    pub media_id: String,
    pub language: String,
    pub label: String,
    pub url: String,
    pub created_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchProgress {
    pub user_id: String,
    pub media_id: String,
    pub progress_seconds: u32,
    pub updated_at: u64,
}

/// Descriptive fields produced by a metadata lookup, or the filename-derived
/// stand-in when no lookup succeeded.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetadataBundle {
    pub title: String,
    pub year: Option<i32>,
    pub overview: Option<String>,
    pub poster_url: Option<String>,
    pub backdrop_url: Option<String>,
    pub genres: Vec<String>,
    pub cast: Vec<String>,
    pub tmdb_id: Option<u64>,
    pub placeholder: bool,
}

/// Where a media file lives. The string form is the dedup key stored on
/// records: a local path verbatim, or `store:<bucket>:<objectKey>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocator {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedLocator(pub String);

impl std::fmt::Display for MalformedLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed storage locator: {}", self.0)
    }
}

impl std::error::Error for MalformedLocator {}

impl StorageLocator {
    pub fn parse(value: &str) -> Result<Self, MalformedLocator> {
        let rest = match value.strip_prefix(STORE_PREFIX) {
            Some(rest) => rest,
            None => return Ok(StorageLocator::Local(PathBuf::from(value))),
        };
        // the object key may itself contain colons
        let mut parts = rest.splitn(2, ':');
        let bucket = parts.next().unwrap_or("");
        let key = match parts.next() {
            Some(key) => key,
            None => return Err(MalformedLocator(value.to_string())),
        };
        if bucket.is_empty() || key.is_empty() {
            return Err(MalformedLocator(value.to_string()));
        }
        Ok(StorageLocator::Remote {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    pub fn remote_path(bucket: &str, key: &str) -> String {
        format!("{}{}:{}", STORE_PREFIX, bucket, key)
    }

    pub fn is_remote_path(value: &str) -> bool {
        value.starts_with(STORE_PREFIX)
    }

    pub fn to_storage_path(&self) -> String {
        match self {
            StorageLocator::Local(path) => path.to_string_lossy().to_string(),
            StorageLocator::Remote { bucket, key } => Self::remote_path(bucket, key),
        }
    }

    pub fn file_name(&self) -> Option<String> {
        match self {
            StorageLocator::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            StorageLocator::Remote { key, .. } => key
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string()),
        }
    }
}

pub fn is_video_file(path: &Path) -> bool {
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return false,
    };
    VIDEO_EXTENSIONS.contains(&ext.as_str())
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
pub fn url_escape(input: &str) -> String {
    urlencoding::encode(input).into_owned()
}

/// Same as [`url_escape`] but keeps `/` so object keys stay readable paths.
pub fn url_escape_path(input: &str) -> String {
    input
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("store:films:Heat (1995).mkv");
        let second = stable_id("store:films:Heat (1995).mkv");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("store:films:Ronin (1998).mkv"));
    }

    #[test]
    fn parses_remote_locator_on_first_two_colons() {
        let locator = StorageLocator::parse("store:films:2024/clip:final.mp4").unwrap();
        assert_eq!(
            locator,
            StorageLocator::Remote {
                bucket: "films".to_string(),
                key: "2024/clip:final.mp4".to_string(),
            }
        );
        assert_eq!(locator.file_name().as_deref(), Some("clip:final.mp4"));
        assert_eq!(locator.to_storage_path(), "store:films:2024/clip:final.mp4");
    }

    #[test]
    fn rejects_locator_with_single_segment() {
        assert!(StorageLocator::parse("store:films").is_err());
        assert!(StorageLocator::parse("store::movie.mp4").is_err());
        assert!(StorageLocator::parse("store:films:").is_err());
    }

    #[test]
    fn plain_paths_are_local() {
        let locator = StorageLocator::parse("/srv/media/Heat (1995).mkv").unwrap();
        assert_eq!(
            locator,
            StorageLocator::Local(PathBuf::from("/srv/media/Heat (1995).mkv"))
        );
        assert!(!StorageLocator::is_remote_path("/srv/media/Heat (1995).mkv"));
    }

    #[test]
    fn video_extension_check_is_case_insensitive() {
        assert!(is_video_file(Path::new("/a/b/Movie.MKV")));
        assert!(is_video_file(Path::new("clip.webm")));
        assert!(!is_video_file(Path::new("notes.txt")));
        assert!(!is_video_file(Path::new("README")));
    }

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(url_escape("The Matrix (1999).mkv"), "The%20Matrix%20%281999%29.mkv");
        assert_eq!(url_escape_path("a b/c.mp4"), "a%20b/c.mp4");
    }

    #[test]
    fn processed_tracks_transcode_state() {
        let mut record = MediaRecord {
            id: "1".to_string(),
            title: "Heat".to_string(),
            year: Some(1995),
            overview: None,
            media_type: MediaType::Movie,
            storage_path: "/m/Heat.mkv".to_string(),
            original_file_name: None,
            poster_url: None,
            backdrop_url: None,
            genres: Vec::new(),
            cast: Vec::new(),
            tmdb_id: None,
            external_id: None,
            renditions: BTreeMap::new(),
            needs_transcode: false,
            transcode_state: TranscodeState::NotStarted,
            created_at: 0,
            updated_at: 0,
        };
        assert!(record.processed());
        record.needs_transcode = true;
        assert!(!record.processed());
        record.transcode_state = TranscodeState::PartiallyComplete;
        assert!(record.processed());
    }
}
