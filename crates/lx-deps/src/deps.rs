//! The dependency cache: compile fingerprint → validated input list.
//!
//! An entry remembers, for every dependency, the stat at record time plus a
//! hash of the file's directive lines. Validation re-stats everything; a
//! stat mismatch gets a second chance via the directive hash, so edits that
//! cannot change the include graph (comments, code bodies) do not throw the
//! entry away.

use std::collections::HashMap;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use lx_proto::{ContentHash, Fingerprint};
use tracing::debug;

use crate::{FileStat, FileStatCache};

/// Fingerprint of a compile for dependency lookup: compiler identity,
/// argument list, primary source, and the environment subset that can steer
/// include resolution. Output-path arguments are excluded — where outputs go
/// cannot change what gets read.
pub fn deps_identifier(
    compiler_hash: &ContentHash,
    args: &[String],
    primary_source: &str,
    env: &[(String, String)],
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();

    hasher.update(b"lynx-deps-v1\n");

    hasher.update(b"compiler:");
    hasher.update(&compiler_hash.0);
    hasher.update(b"\n");

    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "-o" || arg == "-MF" {
            skip_value = true;
            continue;
        }
        hasher.update(b"arg:");
        hasher.update(arg.as_bytes());
        hasher.update(b"\n");
    }

    hasher.update(b"source:");
    hasher.update(primary_source.as_bytes());
    hasher.update(b"\n");

    for (key, value) in env {
        hasher.update(b"env:");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }

    ContentHash(*hasher.finalize().as_bytes())
}

#[derive(Debug, Clone)]
struct DepRecord {
    path: Utf8PathBuf,
    stat: FileStat,
    directive_hash: ContentHash,
}

#[derive(Debug, Clone)]
struct Entry {
    deps: Vec<DepRecord>,
    last_used: u64,
}

/// Thread-safe, size-bounded LRU from fingerprint to dependency list.
#[derive(Debug)]
pub struct DepsCache {
    inner: Mutex<Inner>,
    max_entries: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    tick: u64,
}

impl DepsCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Record the resolved dependency list for `key`. Paths may be relative
    /// to `cwd`. Returns false (and records nothing) if any dependency
    /// cannot be statted or read.
    pub fn record(
        &self,
        key: Fingerprint,
        cwd: &Utf8Path,
        deps: &[Utf8PathBuf],
        stat_cache: &FileStatCache,
    ) -> bool {
        let mut records = Vec::with_capacity(deps.len());
        for dep in deps {
            let abs = join_cwd(cwd, dep);
            let stat = stat_cache.get(&abs);
            if !stat.exists {
                debug!(path = %abs, "deps record skipped: missing dependency");
                return false;
            }
            let Some(directive_hash) = directive_hash(&abs) else {
                debug!(path = %abs, "deps record skipped: unreadable dependency");
                return false;
            };
            records.push(DepRecord {
                path: dep.clone(),
                stat,
                directive_hash,
            });
        }

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k)
            {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                deps: records,
                last_used: tick,
            },
        );
        true
    }

    /// Look up `key`, validating every recorded dependency. On any
    /// validation failure the entry is invalidated and `None` returned.
    pub fn lookup(
        &self,
        key: &Fingerprint,
        cwd: &Utf8Path,
        stat_cache: &FileStatCache,
    ) -> Option<Vec<Utf8PathBuf>> {
        // clone the entry out so no lock is held across file I/O
        let entry = {
            let inner = self.inner.lock().unwrap();
            inner.entries.get(key)?.clone()
        };

        for record in &entry.deps {
            let abs = join_cwd(cwd, &record.path);
            let stat = stat_cache.get(&abs);
            if stat.same_file_as(&record.stat) {
                continue;
            }
            // stat changed; the directive lines may still be identical
            if stat.exists && directive_hash(&abs) == Some(record.directive_hash) {
                continue;
            }
            debug!(path = %abs, "deps entry invalidated");
            self.remove(key);
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_used = tick;
        }

        Some(entry.deps.into_iter().map(|r| r.path).collect())
    }

    pub fn remove(&self, key: &Fingerprint) {
        self.inner.lock().unwrap().entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn join_cwd(cwd: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        cwd.join(path)
    }
}

/// Blake3 of the file's directive lines (comment-stripped, folded).
fn directive_hash(path: &Utf8Path) -> Option<ContentHash> {
    let content = std::fs::read(path).ok()?;
    let filtered = lx_scan::filter::filter_directives(&content).ok()?;
    Some(ContentHash(*blake3::hash(&filtered).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn key() -> Fingerprint {
        deps_identifier(
            &ContentHash::of_bytes(b"cc"),
            &["cc".to_string(), "-c".to_string(), "a.cc".to_string()],
            "a.cc",
            &[],
        )
    }

    #[test]
    fn identifier_ignores_output_path() {
        let ch = ContentHash::of_bytes(b"cc");
        let a = deps_identifier(
            &ch,
            &["cc".into(), "-c".into(), "a.cc".into(), "-o".into(), "x.o".into()],
            "a.cc",
            &[],
        );
        let b = deps_identifier(
            &ch,
            &["cc".into(), "-c".into(), "a.cc".into(), "-o".into(), "y.o".into()],
            "a.cc",
            &[],
        );
        assert_eq!(a, b);

        let c = deps_identifier(
            &ch,
            &["cc".into(), "-c".into(), "b.cc".into()],
            "b.cc",
            &[],
        );
        assert_ne!(a, c);
    }

    #[test]
    fn hit_after_record() {
        let (_dir, root) = setup();
        std::fs::write(root.join("a.cc"), "#include \"a.h\"\n").unwrap();
        std::fs::write(root.join("a.h"), "int f();\n").unwrap();

        let cache = DepsCache::new(16);
        let deps = vec![Utf8PathBuf::from("a.cc"), Utf8PathBuf::from("a.h")];
        assert!(cache.record(key(), &root, &deps, &FileStatCache::new()));

        let got = cache.lookup(&key(), &root, &FileStatCache::new()).unwrap();
        assert_eq!(got, deps);
    }

    #[test]
    fn miss_after_directive_edit() {
        let (_dir, root) = setup();
        std::fs::write(root.join("a.cc"), "#include \"a.h\"\n").unwrap();
        std::fs::write(root.join("a.h"), "int f();\n").unwrap();

        let cache = DepsCache::new(16);
        let deps = vec![Utf8PathBuf::from("a.cc"), Utf8PathBuf::from("a.h")];
        assert!(cache.record(key(), &root, &deps, &FileStatCache::new()));

        // adding an include changes the directive hash: must miss
        std::fs::write(root.join("a.h"), "#include \"b.h\"\nint f();\n").unwrap();
        assert!(cache
            .lookup(&key(), &root, &FileStatCache::new())
            .is_none());
        // and the entry is gone
        assert!(cache.is_empty());
    }

    #[test]
    fn comment_edit_keeps_entry() {
        let (_dir, root) = setup();
        std::fs::write(root.join("a.cc"), "#include \"a.h\"\n").unwrap();
        std::fs::write(root.join("a.h"), "int f();\n").unwrap();

        let cache = DepsCache::new(16);
        let deps = vec![Utf8PathBuf::from("a.cc"), Utf8PathBuf::from("a.h")];
        assert!(cache.record(key(), &root, &deps, &FileStatCache::new()));

        // a comment-only edit changes size/mtime but not directive lines
        std::fs::write(root.join("a.h"), "// doc\nint f();\n").unwrap();
        assert!(cache
            .lookup(&key(), &root, &FileStatCache::new())
            .is_some());
    }

    #[test]
    fn lru_eviction_is_bounded() {
        let (_dir, root) = setup();
        std::fs::write(root.join("a.cc"), "x\n").unwrap();
        let cache = DepsCache::new(2);
        let deps = vec![Utf8PathBuf::from("a.cc")];
        for i in 0..5u8 {
            let k = ContentHash::of_bytes(&[i]);
            assert!(cache.record(k, &root, &deps, &FileStatCache::new()));
        }
        assert_eq!(cache.len(), 2);
    }
}
