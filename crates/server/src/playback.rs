use std::sync::Arc;

use common::{url_escape, EpisodeRecord, MediaRecord, StorageLocator};
use library::{Library, LibraryError};
use serde::Serialize;
use tracing::warn;

use crate::object_store::{presign_locator, ObjectStore, PLAYBACK_URL_TTL};

#[derive(Clone, Debug, Serialize)]
pub struct MediaView {
    #[serde(flatten)]
    pub record: MediaRecord,
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_url: Option<String>,
}

impl MediaView {
    pub fn summary(record: MediaRecord) -> Self {
        Self {
            processed: record.processed(),
            record,
            playback_url: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EpisodeView {
    #[serde(flatten)]
    pub record: EpisodeRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_url: Option<String>,
}

/// Maps a record to a URL the client can play right now. Local files go
/// through the static mount; object-store files get a signed URL that
/// expires after [`PLAYBACK_URL_TTL`].
#[derive(Clone)]
pub struct PlaybackResolver {
    object_store: Option<Arc<dyn ObjectStore>>,
    local_media_prefix: String,
}

impl PlaybackResolver {
    pub fn new(object_store: Option<Arc<dyn ObjectStore>>, local_media_prefix: &str) -> Self {
        Self {
            object_store,
            local_media_prefix: local_media_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub async fn playback_url(&self, storage_path: &str) -> Option<String> {
        if StorageLocator::is_remote_path(storage_path) {
            let store = match &self.object_store {
                Some(store) => store,
                None => {
                    warn!("No object store configured for {}", storage_path);
                    return None;
                }
            };
            return presign_locator(store.as_ref(), storage_path, PLAYBACK_URL_TTL).await;
        }
        let file_name = StorageLocator::Local(storage_path.into()).file_name()?;
        Some(format!("{}/{}", self.local_media_prefix, url_escape(&file_name)))
    }

    pub async fn resolve_media(
        &self,
        library: &Library,
        media_id: &str,
    ) -> Result<Option<MediaView>, LibraryError> {
        let record = match library.get_media(media_id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let playback_url = self.playback_url(&record.storage_path).await;
        Ok(Some(MediaView {
            processed: record.processed(),
            record,
            playback_url,
        }))
    }

    pub async fn resolve_episode(
        &self,
        library: &Library,
        episode_id: &str,
    ) -> Result<Option<EpisodeView>, LibraryError> {
        let record = match library.get_episode(episode_id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let playback_url = self.playback_url(&record.storage_path).await;
        Ok(Some(EpisodeView {
            record,
            playback_url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::tests::MockStore;
    use common::MediaType;
    use library::{InsertOutcome, NewMedia};
    use std::time::Duration;

    fn insert(library: &Library, path: &str) -> String {
        let outcome = library
            .insert_media_if_absent(NewMedia {
                title: "Clip".to_string(),
                year: None,
                overview: None,
                media_type: MediaType::Movie,
                storage_path: path.to_string(),
                original_file_name: None,
                poster_url: None,
                backdrop_url: None,
                needs_transcode: false,
            })
            .unwrap();
        match outcome {
            InsertOutcome::Inserted(record) => record.id,
            InsertOutcome::AlreadyExists(id) => id,
        }
    }

    #[tokio::test]
    async fn local_files_map_under_static_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let id = insert(&library, "/srv/videos/nested/The Matrix (1999).mkv");
        let resolver = PlaybackResolver::new(None, "/files/uploads/videos/");

        let view = resolver.resolve_media(&library, &id).await.unwrap().unwrap();
        assert_eq!(
            view.playback_url.as_deref(),
            Some("/files/uploads/videos/The%20Matrix%20%281999%29.mkv")
        );
        assert!(view.processed);
    }

    #[tokio::test]
    async fn remote_files_are_signed_for_three_hours() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let id = insert(&library, "store:films:clip.mp4");
        let store = Arc::new(MockStore::default());
        let resolver = PlaybackResolver::new(Some(store.clone() as Arc<dyn ObjectStore>), "/files");

        let view = resolver.resolve_media(&library, &id).await.unwrap().unwrap();
        assert!(view.playback_url.is_some());
        let calls = store.presigned.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, Duration::from_secs(10800));
    }

    #[tokio::test]
    async fn malformed_locator_has_no_url() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let id = insert(&library, "store:films");
        let store = Arc::new(MockStore::default());
        let resolver = PlaybackResolver::new(Some(store.clone() as Arc<dyn ObjectStore>), "/files");

        let view = resolver.resolve_media(&library, &id).await.unwrap().unwrap();
        assert!(view.playback_url.is_none());
        assert!(store.presigned.lock().is_empty());
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("playback_url").is_none());
        assert_eq!(json["storage_path"], "store:films");
    }

    #[tokio::test]
    async fn unknown_ids_resolve_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let resolver = PlaybackResolver::new(None, "/files");
        assert!(resolver.resolve_media(&library, "nope").await.unwrap().is_none());
        assert!(resolver.resolve_episode(&library, "nope").await.unwrap().is_none());
    }
}
