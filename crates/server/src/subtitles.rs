use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use encoding_rs::{Encoding, UTF_8};
use regex::Regex;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum SubtitleError {
    Io(std::io::Error),
    UnsupportedFormat(String),
    UnknownEncoding(String),
}

impl std::fmt::Display for SubtitleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtitleError::Io(err) => write!(f, "io error: {}", err),
            SubtitleError::UnsupportedFormat(ext) => {
                write!(f, "unsupported subtitle format: {}", ext)
            }
            SubtitleError::UnknownEncoding(label) => write!(f, "unknown encoding: {}", label),
        }
    }
}

impl std::error::Error for SubtitleError {}

impl From<std::io::Error> for SubtitleError {
    fn from(err: std::io::Error) -> Self {
        SubtitleError::Io(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubtitleFormat {
    Srt,
    Vtt,
}

fn subtitle_format(name: &str) -> Result<SubtitleFormat, SubtitleError> {
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "srt" => Ok(SubtitleFormat::Srt),
        "vtt" => Ok(SubtitleFormat::Vtt),
        _ => Err(SubtitleError::UnsupportedFormat(if ext.is_empty() {
            "(none)".to_string()
        } else {
            ext
        })),
    }
}

fn timestamp_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d{2}:\d{2}:\d{2}),(\d{3})").ok())
        .as_ref()
}

/// Converts uploaded SubRip files into WebVTT for browser playback.
#[derive(Clone)]
pub struct SubtitleNormalizer {
    fallback: &'static Encoding,
}

impl SubtitleNormalizer {
    pub fn new(fallback_label: &str) -> Result<Self, SubtitleError> {
        let fallback = Encoding::for_label(fallback_label.trim().as_bytes())
            .ok_or_else(|| SubtitleError::UnknownEncoding(fallback_label.to_string()))?;
        Ok(Self { fallback })
    }

    pub fn fallback_name(&self) -> &'static str {
        self.fallback.name()
    }

    /// Rejects anything that is not `.srt` or `.vtt` before bytes hit disk.
    pub fn validate_name(name: &str) -> Result<(), SubtitleError> {
        subtitle_format(name).map(|_| ())
    }

    /// Stores an upload under `dir` as `<stem>.<ext>` and normalizes it.
    /// Returns the file name of the resulting `.vtt`.
    pub fn ingest(
        &self,
        dir: &Path,
        stem: &str,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<String, SubtitleError> {
        let format = subtitle_format(original_name)?;
        fs::create_dir_all(dir)?;
        let ext = match format {
            SubtitleFormat::Srt => "srt",
            SubtitleFormat::Vtt => "vtt",
        };
        let raw_path = dir.join(format!("{}.{}", stem, ext));
        fs::write(&raw_path, bytes)?;
        let normalized = match self.normalize(&raw_path) {
            Ok(path) => path,
            Err(err) => {
                let _ = fs::remove_file(&raw_path);
                return Err(err);
            }
        };
        Ok(normalized
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.vtt", stem)))
    }

    /// `.vtt` is returned as-is. `.srt` becomes a sibling `.vtt` and the
    /// original is removed once the new file is in place.
    pub fn normalize(&self, path: &Path) -> Result<PathBuf, SubtitleError> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if subtitle_format(&name)? == SubtitleFormat::Vtt {
            return Ok(path.to_path_buf());
        }

        let bytes = fs::read(path)?;
        let text = self.decode(&bytes);
        let vtt = srt_to_vtt(&text);

        let target = path.with_extension("vtt");
        let temp = path.with_extension("vtt.tmp");
        if let Err(err) = fs::write(&temp, vtt.as_bytes()) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&temp, &target) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }
        if let Err(err) = fs::remove_file(path) {
            warn!("Failed to remove original subtitle {}: {}", path.display(), err);
        }
        Ok(target)
    }

    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
            debug!("Subtitle BOM detected: {}", encoding.name());
            let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
            return text;
        }
        if let Ok(text) = std::str::from_utf8(bytes) {
            return Cow::Borrowed(text);
        }
        debug!("Subtitle is not UTF-8, decoding as {}", self.fallback.name());
        let (text, had_errors) = self.fallback.decode_without_bom_handling(bytes);
        if had_errors && self.fallback != UTF_8 {
            warn!("Subtitle had bytes invalid in {}", self.fallback.name());
        }
        text
    }
}

fn srt_to_vtt(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let body = match timestamp_pattern() {
        Some(pattern) => pattern.replace_all(&unified, "${1}.${2}").into_owned(),
        None => unified,
    };
    let mut out = String::with_capacity(body.len() + 8);
    out.push_str("WEBVTT\n\n");
    out.push_str(body.trim_start_matches('\n'));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\r\n00:00:20,500 --> 00:00:22,000\r\nHello there\r\n\r\n2\r\n00:01:02,003 --> 00:01:04,250\r\nGeneral Kenobi\r\n";

    fn normalizer() -> SubtitleNormalizer {
        SubtitleNormalizer::new("windows-1254").unwrap()
    }

    #[test]
    fn srt_becomes_vtt_and_original_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let srt = dir.path().join("movie.srt");
        fs::write(&srt, SAMPLE).unwrap();

        let vtt = normalizer().normalize(&srt).unwrap();
        assert_eq!(vtt, dir.path().join("movie.vtt"));
        assert!(!srt.exists());
        assert!(!dir.path().join("movie.vtt.tmp").exists());

        let out = fs::read_to_string(&vtt).unwrap();
        assert!(out.starts_with("WEBVTT\n\n"));
        assert!(out.contains("00:00:20.500 --> 00:00:22.000"));
        assert!(out.contains("00:01:02.003 --> 00:01:04.250"));
        assert!(!out.contains('\r'));
        assert!(!out.contains(",500"));
    }

    #[test]
    fn legacy_turkish_bytes_use_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let srt = dir.path().join("tr.srt");
        // "ışğ" in windows-1254
        let mut bytes = b"1\n00:00:01,000 --> 00:00:02,000\n".to_vec();
        bytes.extend_from_slice(&[0xFD, 0xFE, 0xF0, b'\n']);
        fs::write(&srt, &bytes).unwrap();

        let vtt = normalizer().normalize(&srt).unwrap();
        let out = fs::read_to_string(vtt).unwrap();
        assert!(out.contains("ışğ"));
        assert!(out.contains("00:00:01.000"));
    }

    #[test]
    fn utf16_bom_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let srt = dir.path().join("bom.srt");
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "1\n00:00:03,250 --> 00:00:04,000\nçay\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        fs::write(&srt, &bytes).unwrap();

        let out = fs::read_to_string(normalizer().normalize(&srt).unwrap()).unwrap();
        assert!(out.starts_with("WEBVTT\n\n1\n"));
        assert!(out.contains("00:00:03.250"));
        assert!(out.contains("çay"));
    }

    #[test]
    fn vtt_passes_through_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let vtt = dir.path().join("ready.vtt");
        fs::write(&vtt, "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nhi\n").unwrap();
        let out = normalizer().normalize(&vtt).unwrap();
        assert_eq!(out, vtt);
        assert_eq!(
            fs::read_to_string(&vtt).unwrap(),
            "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nhi\n"
        );
    }

    #[test]
    fn other_formats_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ass = dir.path().join("styled.ass");
        fs::write(&ass, "[Script Info]").unwrap();
        assert!(matches!(
            normalizer().normalize(&ass),
            Err(SubtitleError::UnsupportedFormat(ext)) if ext == "ass"
        ));
        assert!(ass.exists());
        assert!(SubtitleNormalizer::validate_name("noext").is_err());
        assert!(SubtitleNormalizer::validate_name("Movie.SRT").is_ok());
    }

    #[test]
    fn ingest_writes_normalized_file() {
        let dir = tempfile::tempdir().unwrap();
        let subs = dir.path().join("subs");
        let name = normalizer()
            .ingest(&subs, "abc", "Episode 1.SRT", SAMPLE.as_bytes())
            .unwrap();
        assert_eq!(name, "abc.vtt");
        assert!(subs.join("abc.vtt").is_file());
        assert!(!subs.join("abc.srt").exists());
    }

    #[test]
    fn unknown_fallback_label_is_an_error() {
        assert!(matches!(
            SubtitleNormalizer::new("klingon-1"),
            Err(SubtitleError::UnknownEncoding(_))
        ));
        assert_eq!(normalizer().fallback_name(), "windows-1254");
    }
}
