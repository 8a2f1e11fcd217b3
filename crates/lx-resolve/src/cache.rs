//! Shared caches for the resolver: interned directive lists and memoized
//! per-file resolutions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use lx_proto::ContentHash;
use lx_scan::{DirectiveList, ScanError};

use crate::macros::{MacroDef, MacroEnv};

/// Interned directive lists keyed by (path, content hash). Re-parsing the
/// same header for every translation unit would dominate resolver time.
#[derive(Debug, Default)]
pub struct DirectiveCache {
    inner: Mutex<DirectiveCacheInner>,
    max_entries: usize,
}

#[derive(Debug, Default)]
struct DirectiveCacheInner {
    entries: HashMap<(Utf8PathBuf, ContentHash), (Arc<DirectiveList>, u64)>,
    tick: u64,
}

impl DirectiveCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(DirectiveCacheInner::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Fetch the directive list for `path` with the given content, scanning
    /// on first sight of this (path, content) pair.
    pub fn get_or_parse(
        &self,
        path: &Utf8PathBuf,
        content: &[u8],
    ) -> Result<(ContentHash, Arc<DirectiveList>), ScanError> {
        let hash = ContentHash::of_bytes(content);
        let key = (path.clone(), hash);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.tick += 1;
            let tick = inner.tick;
            if let Some((list, last_used)) = inner.entries.get_mut(&key) {
                *last_used = tick;
                return Ok((hash, list.clone()));
            }
        }

        // scan outside the lock
        let list = Arc::new(lx_scan::scan_directives(content)?);

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, last))| *last)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
        inner
            .entries
            .entry(key)
            .or_insert((list.clone(), tick));
        Ok((hash, list))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one file's evaluation did, in order. Replaying the ops against the
/// current environment reproduces the evaluation without touching the
/// directive list again.
#[derive(Debug, Clone)]
pub enum TraceOp {
    Define(MacroDef),
    Undef(String),
    Include {
        /// The resolved path that was included
        path: Utf8PathBuf,
        /// Search-chain index it was found at (`None` = includer's
        /// directory, absolute include, or the primary source)
        found_at: Option<usize>,
        /// Whether it was an `#import` (visited at most once)
        import: bool,
    },
}

/// A memoized per-file resolution: valid whenever every tracked macro read
/// observes the same state it did when recorded.
#[derive(Debug)]
pub struct MemoEntry {
    pub tracked: Vec<(String, Option<u64>)>,
    pub ops: Vec<TraceOp>,
    pub pragma_once: bool,
}

impl MemoEntry {
    fn matches(&self, env: &MacroEnv) -> bool {
        self.tracked
            .iter()
            .all(|(name, observed)| env.observe(name) == *observed)
    }
}

/// Memoized resolutions keyed by (file content hash, search-config hash).
/// A handful of entries are kept per file, for headers whose effect depends
/// on incoming macros.
#[derive(Debug, Default)]
pub struct IncludeMemoCache {
    inner: Mutex<HashMap<(ContentHash, u64), Vec<Arc<MemoEntry>>>>,
}

/// Entries kept per (content, config) key.
const MEMO_VARIANTS_PER_FILE: usize = 4;

impl IncludeMemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a memoized resolution valid under the current macro state.
    pub fn lookup(
        &self,
        content_hash: &ContentHash,
        config_hash: u64,
        env: &MacroEnv,
    ) -> Option<Arc<MemoEntry>> {
        let inner = self.inner.lock().unwrap();
        let candidates = inner.get(&(*content_hash, config_hash))?;
        candidates.iter().find(|e| e.matches(env)).cloned()
    }

    pub fn store(&self, content_hash: ContentHash, config_hash: u64, entry: MemoEntry) {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.entry((content_hash, config_hash)).or_default();
        if slot.len() >= MEMO_VARIANTS_PER_FILE {
            slot.remove(0);
        }
        slot.push(Arc::new(entry));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_cache_interns_by_content() {
        let cache = DirectiveCache::new(8);
        let path = Utf8PathBuf::from("/x/a.h");
        let (h1, l1) = cache.get_or_parse(&path, b"#include <a>\n").unwrap();
        let (h2, l2) = cache.get_or_parse(&path, b"#include <a>\n").unwrap();
        assert_eq!(h1, h2);
        assert!(Arc::ptr_eq(&l1, &l2));

        // changed content is a different entry
        let (h3, _) = cache.get_or_parse(&path, b"#include <b>\n").unwrap();
        assert_ne!(h1, h3);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn memo_entry_matching() {
        let memo = IncludeMemoCache::new();
        let hash = ContentHash::of_bytes(b"header");

        memo.store(
            hash,
            1,
            MemoEntry {
                tracked: vec![("FOO".to_string(), None)],
                ops: vec![],
                pragma_once: false,
            },
        );

        // FOO undefined: matches
        let env = MacroEnv::new();
        assert!(memo.lookup(&hash, 1, &env).is_some());

        // FOO defined: the recorded run observed it undefined, so no match
        let mut env2 = MacroEnv::new();
        env2.define(MacroDef::object("FOO", vec![]));
        assert!(memo.lookup(&hash, 1, &env2).is_none());

        // different search config: no match
        assert!(memo.lookup(&hash, 2, &env).is_none());
    }
}
