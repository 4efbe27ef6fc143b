use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::url_escape;
use tokio::process::Command;
use tracing::{info, warn};

use crate::object_store::ObjectStore;

/// Lifetime of the signed URL one rendition reads a remote source through.
pub const TRANSCODE_SOURCE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rendition {
    pub label: &'static str,
    pub height: u32,
    pub video_bitrate_kbps: u32,
}

/// Encoded in this order, highest quality first.
pub const QUALITY_LADDER: [Rendition; 3] = [
    Rendition {
        label: "1080p",
        height: 1080,
        video_bitrate_kbps: 4500,
    },
    Rendition {
        label: "720p",
        height: 720,
        video_bitrate_kbps: 2500,
    },
    Rendition {
        label: "480p",
        height: 480,
        video_bitrate_kbps: 1000,
    },
];

#[derive(Clone, Debug)]
pub enum TranscodeInput {
    File(PathBuf),
    /// Remote source handed to the encoder as a signed URL.
    Url(String),
}

/// What the ladder reads from. Object-store sources are signed again before
/// every rendition, so a long ladder never runs on an expired URL.
pub enum TranscodeSource<'a> {
    File(PathBuf),
    Object {
        store: &'a dyn ObjectStore,
        bucket: &'a str,
        key: &'a str,
    },
}

impl TranscodeSource<'_> {
    async fn input_for(&self, rendition: &Rendition) -> Option<TranscodeInput> {
        match self {
            TranscodeSource::File(path) => {
                if path.is_file() {
                    Some(TranscodeInput::File(path.clone()))
                } else {
                    warn!(
                        "Source {} missing, skipping {}",
                        path.display(),
                        rendition.label
                    );
                    None
                }
            }
            TranscodeSource::Object { store, bucket, key } => {
                match store.presign_get(bucket, key, TRANSCODE_SOURCE_TTL).await {
                    Ok(url) => Some(TranscodeInput::Url(url)),
                    Err(err) => {
                        warn!(
                            "Cannot sign {}/{} for {}: {}",
                            bucket, key, rendition.label, err
                        );
                        None
                    }
                }
            }
        }
    }
}

impl TranscodeInput {
    fn as_arg(&self) -> &std::ffi::OsStr {
        match self {
            TranscodeInput::File(path) => path.as_os_str(),
            TranscodeInput::Url(url) => std::ffi::OsStr::new(url.as_str()),
        }
    }
}

#[derive(Debug)]
pub enum TranscodeError {
    Io(std::io::Error),
    Encoder(String),
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeError::Io(err) => write!(f, "io error: {}", err),
            TranscodeError::Encoder(message) => write!(f, "encoder error: {}", message),
        }
    }
}

impl std::error::Error for TranscodeError {}

impl From<std::io::Error> for TranscodeError {
    fn from(err: std::io::Error) -> Self {
        TranscodeError::Io(err)
    }
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Writes one rendition of `input` to `output`.
    async fn encode(
        &self,
        input: &TranscodeInput,
        output: &Path,
        rendition: &Rendition,
    ) -> Result<(), TranscodeError>;
}

pub struct FfmpegEncoder {
    program: String,
}

impl FfmpegEncoder {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        input: &TranscodeInput,
        output: &Path,
        rendition: &Rendition,
    ) -> Result<(), TranscodeError> {
        let result = Command::new(&self.program)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input.as_arg())
            .arg("-vf")
            .arg(format!("scale=-2:{}", rendition.height))
            .args(["-c:v", "libx264"])
            .arg("-b:v")
            .arg(format!("{}k", rendition.video_bitrate_kbps))
            .args(["-c:a", "aac", "-movflags", "+faststart", "-f", "mp4"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if result.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
        Err(TranscodeError::Encoder(format!(
            "{} exited with {}: {}",
            self.program,
            result.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )))
    }
}

/// Runs the quality ladder for one source. A rendition that cannot be produced
/// is logged and skipped; the others still run.
#[derive(Clone)]
pub struct TranscodeEngine {
    encoder: Arc<dyn Encoder>,
    output_dir: PathBuf,
    public_prefix: String,
}

impl TranscodeEngine {
    pub fn new(encoder: Arc<dyn Encoder>, output_dir: PathBuf, public_prefix: &str) -> Self {
        Self {
            encoder,
            output_dir,
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn ladder_len(&self) -> usize {
        QUALITY_LADDER.len()
    }

    /// Returns label → public URL for every rendition written. `on_rendition`
    /// fires right after each one lands so callers can persist incrementally;
    /// an error from it stops the ladder.
    pub async fn transcode<F, E>(
        &self,
        source: &TranscodeSource<'_>,
        base_name: &str,
        mut on_rendition: F,
    ) -> Result<BTreeMap<String, String>, E>
    where
        F: FnMut(&str, &str) -> Result<(), E> + Send,
    {
        let mut produced = BTreeMap::new();
        if let Err(err) = tokio::fs::create_dir_all(&self.output_dir).await {
            warn!(
                "Cannot create renditions dir {}: {}",
                self.output_dir.display(),
                err
            );
            return Ok(produced);
        }

        for rendition in QUALITY_LADDER.iter() {
            let input = match source.input_for(rendition).await {
                Some(input) => input,
                None => continue,
            };

            let file_name = format!("{}_{}.mp4", base_name, rendition.label);
            let final_path = self.output_dir.join(&file_name);
            let temp_path = self.output_dir.join(format!(".{}.part", file_name));

            if let Err(err) = self.encoder.encode(&input, &temp_path, rendition).await {
                warn!("Rendition {} failed for {}: {}", rendition.label, base_name, err);
                let _ = tokio::fs::remove_file(&temp_path).await;
                continue;
            }
            if let Err(err) = tokio::fs::rename(&temp_path, &final_path).await {
                warn!("Failed to finalize {}: {}", final_path.display(), err);
                let _ = tokio::fs::remove_file(&temp_path).await;
                continue;
            }

            let url = format!("{}/{}", self.public_prefix, url_escape(&file_name));
            info!("Rendition {} ready: {}", rendition.label, url);
            on_rendition(rendition.label, &url)?;
            produced.insert(rendition.label.to_string(), url);
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedEncoder {
        fail_labels: Vec<&'static str>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Encoder for ScriptedEncoder {
        async fn encode(
            &self,
            _input: &TranscodeInput,
            output: &Path,
            rendition: &Rendition,
        ) -> Result<(), TranscodeError> {
            self.calls.lock().push(rendition.label);
            // partial output first, like an encoder dying mid-file
            tokio::fs::write(output, b"partial").await?;
            if self.fail_labels.contains(&rendition.label) {
                return Err(TranscodeError::Encoder("simulated failure".to_string()));
            }
            tokio::fs::write(output, format!("video {}", rendition.label)).await?;
            Ok(())
        }
    }

    fn engine(dir: &Path, fail_labels: Vec<&'static str>) -> (TranscodeEngine, Arc<ScriptedEncoder>) {
        let encoder = Arc::new(ScriptedEncoder {
            fail_labels,
            calls: Mutex::new(Vec::new()),
        });
        let engine = TranscodeEngine::new(
            encoder.clone(),
            dir.join("renditions"),
            "/files/uploads/renditions",
        );
        (engine, encoder)
    }

    #[test]
    fn ladder_is_ordered_high_to_low() {
        let labels: Vec<_> = QUALITY_LADDER.iter().map(|r| r.label).collect();
        assert_eq!(labels, vec!["1080p", "720p", "480p"]);
        let bitrates: Vec<_> = QUALITY_LADDER.iter().map(|r| r.video_bitrate_kbps).collect();
        assert_eq!(bitrates, vec![4500, 2500, 1000]);
    }

    #[tokio::test]
    async fn failed_rendition_is_skipped_and_others_continue() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("movie.mkv");
        std::fs::write(&source, b"source").unwrap();
        let (engine, encoder) = engine(dir.path(), vec!["720p"]);

        let mut reported = Vec::new();
        let produced = engine
            .transcode(&TranscodeSource::File(source), "abc123", |label, url| {
                reported.push((label.to_string(), url.to_string()));
                Ok::<(), std::io::Error>(())
            })
            .await
            .unwrap();

        assert_eq!(
            produced.keys().cloned().collect::<Vec<_>>(),
            vec!["1080p".to_string(), "480p".to_string()]
        );
        assert_eq!(
            produced.get("1080p").map(String::as_str),
            Some("/files/uploads/renditions/abc123_1080p.mp4")
        );
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, "1080p");
        assert_eq!(reported[1].0, "480p");
        assert_eq!(*encoder.calls.lock(), vec!["1080p", "720p", "480p"]);

        let out_dir = dir.path().join("renditions");
        assert!(out_dir.join("abc123_1080p.mp4").is_file());
        assert!(out_dir.join("abc123_480p.mp4").is_file());
        assert!(!out_dir.join("abc123_720p.mp4").exists());
        let leftovers: Vec<_> = std::fs::read_dir(&out_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_local_source_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, encoder) = engine(dir.path(), Vec::new());
        let produced = engine
            .transcode(
                &TranscodeSource::File(dir.path().join("gone.mkv")),
                "gone",
                |_, _| Ok::<(), std::io::Error>(()),
            )
            .await
            .unwrap();
        assert!(produced.is_empty());
        assert!(encoder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn callback_error_stops_the_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, b"source").unwrap();
        let (engine, encoder) = engine(dir.path(), Vec::new());
        let result = engine
            .transcode(&TranscodeSource::File(source), "clip", |_, _| Err("db down"))
            .await;
        assert_eq!(result.unwrap_err(), "db down");
        assert_eq!(*encoder.calls.lock(), vec!["1080p"]);
    }

    #[tokio::test]
    async fn remote_source_is_signed_per_rendition() {
        use crate::object_store::tests::MockStore;

        let dir = tempfile::tempdir().unwrap();
        let (engine, encoder) = engine(dir.path(), Vec::new());
        let store = MockStore::default();
        let source = TranscodeSource::Object {
            store: &store,
            bucket: "films",
            key: "long/feature.mkv",
        };
        let produced = engine
            .transcode(&source, "feature", |_, _| Ok::<(), std::io::Error>(()))
            .await
            .unwrap();
        assert_eq!(produced.len(), 3);
        assert_eq!(encoder.calls.lock().len(), 3);
        let signed = store.presigned.lock().clone();
        assert_eq!(signed.len(), 3);
        assert!(signed.iter().all(|(_, _, ttl)| *ttl == TRANSCODE_SOURCE_TTL));
    }

    #[tokio::test]
    async fn unsignable_remote_source_skips_every_rendition() {
        use crate::object_store::tests::MockStore;

        let dir = tempfile::tempdir().unwrap();
        let (engine, encoder) = engine(dir.path(), Vec::new());
        let store = MockStore {
            fail_presign: true,
            ..MockStore::default()
        };
        let source = TranscodeSource::Object {
            store: &store,
            bucket: "films",
            key: "feature.mkv",
        };
        let produced = engine
            .transcode(&source, "feature", |_, _| Ok::<(), std::io::Error>(()))
            .await
            .unwrap();
        assert!(produced.is_empty());
        assert!(encoder.calls.lock().is_empty());
    }
}
