//! Lazily computed, per-task file metadata.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use lx_proto::ContentHash;

/// Metadata for one path at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub exists: bool,
    pub size: u64,
    pub mtime_ns: u64,
    /// Filled in only when somebody needed the content hash
    pub content_hash: Option<ContentHash>,
}

impl FileStat {
    pub fn missing() -> Self {
        Self {
            exists: false,
            size: 0,
            mtime_ns: 0,
            content_hash: None,
        }
    }

    /// Stat `path` now. A failed stat yields a `missing` record, which is a
    /// legitimate cacheable answer.
    pub fn new(path: &Utf8Path) -> Self {
        let Ok(meta) = std::fs::metadata(path) else {
            return Self::missing();
        };
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            exists: true,
            size: meta.len(),
            mtime_ns,
            content_hash: None,
        }
    }

    /// Same identity, ignoring whether the content hash happens to be filled.
    pub fn same_file_as(&self, other: &FileStat) -> bool {
        self.exists == other.exists && self.size == other.size && self.mtime_ns == other.mtime_ns
    }
}

/// Path → stat cache scoped to one compile task.
///
/// A task never re-stats the same path twice; stat results feed both the
/// dependency-cache validation and the upload set. Interior mutability lets
/// concurrent file workers share one instance; critical sections only cover
/// the map, never the syscall.
#[derive(Debug, Default)]
pub struct FileStatCache {
    stats: Mutex<HashMap<Utf8PathBuf, FileStat>>,
}

impl FileStatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stat through the cache.
    pub fn get(&self, path: &Utf8Path) -> FileStat {
        if let Some(stat) = self.stats.lock().unwrap().get(path) {
            return stat.clone();
        }
        let stat = FileStat::new(path);
        self.stats
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_insert(stat)
            .clone()
    }

    /// Record a content hash alongside an already cached stat.
    pub fn set_content_hash(&self, path: &Utf8Path, hash: ContentHash) {
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(path.to_owned()).or_insert_with(FileStat::missing);
        entry.content_hash = Some(hash);
    }

    pub fn len(&self) -> usize {
        self.stats.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_caches_first_answer() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("f.txt")).unwrap();
        std::fs::write(&path, b"one").unwrap();

        let cache = FileStatCache::new();
        let first = cache.get(&path);
        assert!(first.exists);
        assert_eq!(first.size, 3);

        // grow the file; the cached answer must not change within this task
        std::fs::write(&path, b"longer content").unwrap();
        let second = cache.get(&path);
        assert_eq!(second.size, 3);
    }

    #[test]
    fn missing_files_are_cached_too() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("gone.h")).unwrap();
        let cache = FileStatCache::new();
        assert!(!cache.get(&path).exists);
        assert_eq!(cache.len(), 1);
    }
}
