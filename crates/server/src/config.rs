use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub server: HttpSettings,
    pub media: MediaSettings,
    pub object_store: ObjectStoreSettings,
    pub metadata: MetadataSettings,
    pub transcode: TranscodeSettings,
    pub jobs: JobSettings,
    pub subtitles: SubtitleSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            server: HttpSettings::default(),
            media: MediaSettings::default(),
            object_store: ObjectStoreSettings::default(),
            metadata: MetadataSettings::default(),
            transcode: TranscodeSettings::default(),
            jobs: JobSettings::default(),
            subtitles: SubtitleSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub port: u16,
    pub index_path: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            index_path: "library.redb".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    /// Local directory scanned for video files. Empty disables the local source.
    pub media_root: String,
    pub static_root: String,
    pub public_prefix: String,
    pub local_media_prefix: String,
    pub renditions_dir: String,
    pub renditions_prefix: String,
    pub subtitles_dir: String,
    pub subtitles_prefix: String,
    pub watch_media: bool,
    pub watch_debounce_secs: u64,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            media_root: "public/uploads/videos".to_string(),
            static_root: "public".to_string(),
            public_prefix: "/files".to_string(),
            local_media_prefix: "/files/uploads/videos".to_string(),
            renditions_dir: "public/uploads/renditions".to_string(),
            renditions_prefix: "/files/uploads/renditions".to_string(),
            subtitles_dir: "public/uploads/subtitles".to_string(),
            subtitles_prefix: "/files/uploads/subtitles".to_string(),
            watch_media: false,
            watch_debounce_secs: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSettings {
    /// Base URL of an S3-compatible endpoint. Empty disables the remote source.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    pub buckets: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: "us-east-1".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            path_style: true,
            buckets: Vec::new(),
            timeout_secs: 10,
        }
    }
}

impl ObjectStoreSettings {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty()
            && !self.access_key.trim().is_empty()
            && !self.secret_key.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataSettings {
    pub enabled: bool,
    pub api_key: String,
    pub base_url: String,
    pub image_base_url: String,
    pub languages: Vec<String>,
    pub timeout_secs: u64,
    pub min_interval_secs: u64,
    pub enrich_on_scan: bool,
    pub scan_limit: usize,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            base_url: "https://api.themoviedb.org/3".to_string(),
            image_base_url: "https://image.tmdb.org/t/p".to_string(),
            languages: vec!["en-US".to_string()],
            timeout_secs: 8,
            min_interval_secs: 60 * 60 * 24,
            enrich_on_scan: false,
            scan_limit: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSettings {
    pub ffmpeg_path: String,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            retry_delay_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleSettings {
    /// WHATWG label of the legacy encoding tried when a file is not UTF-8.
    pub fallback_encoding: String,
}

impl Default for SubtitleSettings {
    fn default() -> Self {
        Self {
            fallback_encoding: "windows-1254".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("REELVAULT_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        normalize(&mut config);
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

fn normalize(config: &mut ServerConfig) {
    if config.version < CONFIG_VERSION {
        config.version = CONFIG_VERSION;
    }
    if config.server.port == 0 {
        config.server.port = 3000;
    }
    if config.server.index_path.trim().is_empty() {
        config.server.index_path = "library.redb".to_string();
    }
    if config.media.watch_debounce_secs == 0 {
        config.media.watch_debounce_secs = 2;
    }
    for prefix in [
        &mut config.media.public_prefix,
        &mut config.media.local_media_prefix,
        &mut config.media.renditions_prefix,
        &mut config.media.subtitles_prefix,
    ] {
        *prefix = normalize_prefix(prefix);
    }
    config.object_store.buckets.retain(|bucket| !bucket.trim().is_empty());
    config
        .metadata
        .languages
        .retain(|language| !language.trim().is_empty());
    if config.metadata.languages.is_empty() {
        config.metadata.languages.push("en-US".to_string());
    }
    if config.metadata.timeout_secs == 0 {
        config.metadata.timeout_secs = 8;
    }
    if config.transcode.ffmpeg_path.trim().is_empty() {
        config.transcode.ffmpeg_path = "ffmpeg".to_string();
    }
    if config.jobs.workers == 0 {
        config.jobs.workers = 1;
    }
    if config.jobs.max_attempts == 0 {
        config.jobs.max_attempts = 1;
    }
    if config.subtitles.fallback_encoding.trim().is_empty() {
        config.subtitles.fallback_encoding = "windows-1254".to_string();
    }
}

/// `files/` and `/files/` both become `/files`.
fn normalize_prefix(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_optional_path(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

/// Filesystem locations from the config, resolved against the config file.
#[derive(Clone, Debug)]
pub struct MediaPaths {
    pub media_root: Option<PathBuf>,
    pub static_root: PathBuf,
    pub renditions_dir: PathBuf,
    pub subtitles_dir: PathBuf,
}

impl MediaPaths {
    pub fn resolve(config_path: &Path, media: &MediaSettings) -> Self {
        Self {
            media_root: resolve_optional_path(config_path, &media.media_root),
            static_root: resolve_path(config_path, &media.static_root),
            renditions_dir: resolve_path(config_path, &media.renditions_dir),
            subtitles_dir: resolve_path(config_path, &media.subtitles_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.subtitles.fallback_encoding, "windows-1254");

        let (_, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
    }

    #[test]
    fn partial_yaml_is_filled_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "server:\n  port: 0\nmedia:\n  public_prefix: files/\nmetadata:\n  languages: []\njobs:\n  workers: 0\n",
        )
        .unwrap();
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.media.public_prefix, "/files");
        assert_eq!(config.metadata.languages, vec!["en-US".to_string()]);
        assert_eq!(config.jobs.workers, 1);
        assert_eq!(config.jobs.max_attempts, 3);
    }

    #[test]
    fn relative_paths_resolve_next_to_config() {
        let config_path = Path::new("/etc/reelvault/config.yaml");
        assert_eq!(
            resolve_path(config_path, "library.redb"),
            PathBuf::from("/etc/reelvault/library.redb")
        );
        assert_eq!(
            resolve_path(config_path, "/srv/media"),
            PathBuf::from("/srv/media")
        );
        assert!(resolve_optional_path(config_path, "  ").is_none());
    }
}
