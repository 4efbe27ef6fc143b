use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Lazily yields every regular file below a root, following symlinks.
///
/// Directory loops are reported by walkdir and skipped. Paths come out in
/// canonical form, so a file reachable through more than one link is yielded
/// once under the same path whichever alias the walk meets first.
pub struct MediaWalk {
    inner: Option<walkdir::IntoIter>,
    seen: HashSet<PathBuf>,
}

pub fn walk_media_files(root: &Path) -> MediaWalk {
    if !root.is_dir() {
        return MediaWalk {
            inner: None,
            seen: HashSet::new(),
        };
    }
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let walker = WalkDir::new(root).follow_links(true).sort_by_file_name();
    MediaWalk {
        inner: Some(walker.into_iter()),
        seen: HashSet::new(),
    }
}

impl Iterator for MediaWalk {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        let inner = self.inner.as_mut()?;
        loop {
            let entry = match inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    if err.loop_ancestor().is_some() {
                        debug!("skipping symlink loop: {}", err);
                    } else {
                        warn!("walk error: {}", err);
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            let canonical = fs::canonicalize(&path).unwrap_or(path);
            if self.seen.insert(canonical.clone()) {
                return Some(canonical);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(walk_media_files(&dir.path().join("absent")).count(), 0);
    }

    #[test]
    fn recurses_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.mp4"), b"x").unwrap();
        fs::write(dir.path().join("a/b/deep.mkv"), b"x").unwrap();
        fs::write(dir.path().join("a/notes.txt"), b"x").unwrap();

        let mut names: Vec<String> = walk_media_files(dir.path())
            .map(|path| {
                assert!(path.is_absolute());
                path.file_name().unwrap().to_string_lossy().to_string()
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["deep.mkv", "notes.txt", "top.mp4"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_terminate_and_dedupe() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let shows = dir.path().join("shows");
        fs::create_dir_all(&shows).unwrap();
        fs::write(shows.join("pilot.mkv"), b"x").unwrap();
        symlink(&shows, shows.join("loop")).unwrap();
        symlink(&shows, dir.path().join("alias")).unwrap();

        let found: Vec<PathBuf> = walk_media_files(dir.path()).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], fs::canonicalize(shows.join("pilot.mkv")).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn file_aliases_resolve_to_one_path() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real.mkv");
        fs::write(&real, b"x").unwrap();
        symlink(&real, dir.path().join("alias.mkv")).unwrap();
        symlink(&real, dir.path().join("zz-alias.mkv")).unwrap();

        let found: Vec<PathBuf> = walk_media_files(dir.path()).collect();
        assert_eq!(found, vec![fs::canonicalize(&real).unwrap()]);
    }
}
