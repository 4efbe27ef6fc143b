use common::{MediaRecord, WatchProgress};
use redb::{ReadableTable, TableError};

use crate::{
    decode_value, encode_value, join_key, now_secs, prefix_key, split_key_last, Library,
    LibraryError, EMPTY_VALUE, FAVORITES_TABLE, MEDIA_TABLE, WATCH_PROGRESS_TABLE,
};

impl Library {
    /// Last write wins; unknown media ids are refused with `None`.
    pub fn set_progress(
        &self,
        user_id: &str,
        media_id: &str,
        progress_seconds: u32,
    ) -> Result<Option<WatchProgress>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let progress = {
            let media_table = write_txn.open_table(MEDIA_TABLE)?;
            if media_table.get(media_id)?.is_none() {
                return Ok(None);
            }
            let progress = WatchProgress {
                user_id: user_id.to_string(),
                media_id: media_id.to_string(),
                progress_seconds,
                updated_at: now_secs(),
            };
            let mut table = write_txn.open_table(WATCH_PROGRESS_TABLE)?;
            let bytes = encode_value(&progress)?;
            table.insert(join_key(user_id, media_id).as_str(), bytes.as_slice())?;
            progress
        };
        write_txn.commit()?;
        Ok(Some(progress))
    }

    pub fn get_progress(
        &self,
        user_id: &str,
        media_id: &str,
    ) -> Result<Option<WatchProgress>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(WATCH_PROGRESS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let progress = match table.get(join_key(user_id, media_id).as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(progress)
    }

    /// Most recently updated first.
    pub fn list_progress(&self, user_id: &str) -> Result<Vec<WatchProgress>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WATCH_PROGRESS_TABLE)?;
        let prefix = prefix_key(user_id);
        let mut end = prefix.clone();
        end.push('\u{10ffff}');
        let mut items = Vec::new();
        for entry in table.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let progress: WatchProgress = decode_value(entry.1.value())?;
            items.push(progress);
        }
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }

    pub fn add_favorite(&self, user_id: &str, media_id: &str) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let media_table = write_txn.open_table(MEDIA_TABLE)?;
            if media_table.get(media_id)?.is_none() {
                return Ok(false);
            }
            let mut table = write_txn.open_table(FAVORITES_TABLE)?;
            table.insert(join_key(user_id, media_id).as_str(), EMPTY_VALUE)?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    pub fn remove_favorite(&self, user_id: &str, media_id: &str) -> Result<bool, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(FAVORITES_TABLE)?;
            let removed = table.remove(join_key(user_id, media_id).as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list_favorites(&self, user_id: &str) -> Result<Vec<MediaRecord>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let favorites = read_txn.open_table(FAVORITES_TABLE)?;
        let media_table = read_txn.open_table(MEDIA_TABLE)?;
        let prefix = prefix_key(user_id);
        let mut end = prefix.clone();
        end.push('\u{10ffff}');
        let mut items = Vec::new();
        for entry in favorites.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let (_, media_id) = split_key_last(entry.0.value())?;
            if let Some(value) = media_table.get(media_id)? {
                let record: MediaRecord = decode_value(value.value())?;
                items.push(record);
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use crate::{InsertOutcome, Library, NewMedia};
    use common::MediaType;

    fn seeded() -> (tempfile::TempDir, Library, String) {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::open(&dir.path().join("index.redb")).unwrap();
        let outcome = library
            .insert_media_if_absent(NewMedia {
                title: "Heat".to_string(),
                year: Some(1995),
                overview: None,
                media_type: MediaType::Movie,
                storage_path: "/m/heat.mkv".to_string(),
                original_file_name: Some("heat.mkv".to_string()),
                poster_url: None,
                backdrop_url: None,
                needs_transcode: false,
            })
            .unwrap();
        let id = match outcome {
            InsertOutcome::Inserted(record) => record.id,
            InsertOutcome::AlreadyExists(id) => id,
        };
        (dir, library, id)
    }

    #[test]
    fn progress_is_last_write_wins() {
        let (_dir, library, id) = seeded();
        library.set_progress("alice", &id, 30).unwrap();
        library.set_progress("alice", &id, 95).unwrap();
        let progress = library.get_progress("alice", &id).unwrap().unwrap();
        assert_eq!(progress.progress_seconds, 95);
        assert!(library.get_progress("bob", &id).unwrap().is_none());
        assert_eq!(library.list_progress("alice").unwrap().len(), 1);
        assert!(library.set_progress("alice", "missing", 10).unwrap().is_none());
    }

    #[test]
    fn favorites_are_per_user_sets() {
        let (_dir, library, id) = seeded();
        assert!(library.add_favorite("alice", &id).unwrap());
        assert!(library.add_favorite("alice", &id).unwrap());
        assert!(!library.add_favorite("alice", "missing").unwrap());
        assert_eq!(library.list_favorites("alice").unwrap().len(), 1);
        assert!(library.list_favorites("bob").unwrap().is_empty());
        assert!(library.remove_favorite("alice", &id).unwrap());
        assert!(!library.remove_favorite("alice", &id).unwrap());
        assert!(library.list_favorites("alice").unwrap().is_empty());
    }
}
