//! Local output cache.
//!
//! Content-addressed store of compiler outputs keyed by compile fingerprint
//! (compiler + argv + full input content hash). A hit skips the remote call
//! entirely. Blobs live under `blobs/ab/abcdef...`, shared between entries;
//! a small JSON index maps fingerprints to their output sets. Eviction is
//! size-bounded LRU; publication is atomic-rename so a crash never leaves a
//! half-written blob visible.

use std::collections::HashMap;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use facet::Facet;
use lx_proto::{ContentHash, Fingerprint};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum OutputCacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the cache key for a compile: everything that affects the output
/// bytes. Inputs are keyed by content, not by stat, so the cache survives
/// `touch`.
pub fn output_cache_key(
    compiler_hash: &ContentHash,
    args: &[String],
    inputs: &[(String, ContentHash)],
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();

    hasher.update(b"lynx-output-cache-v1\n");

    hasher.update(b"compiler:");
    hasher.update(&compiler_hash.0);
    hasher.update(b"\n");

    for arg in args {
        hasher.update(b"arg:");
        hasher.update(arg.as_bytes());
        hasher.update(b"\n");
    }

    // sorted for determinism regardless of resolver visitation order
    let mut sorted: Vec<&(String, ContentHash)> = inputs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (path, hash) in sorted {
        hasher.update(b"input:");
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(&hash.0);
        hasher.update(b"\n");
    }

    ContentHash(*hasher.finalize().as_bytes())
}

/// A cache hit: output metadata with blob paths, plus the diagnostics the
/// original compile produced.
#[derive(Debug)]
pub struct CacheHitEntry {
    pub outputs: Vec<(CachedOutput, Utf8PathBuf)>,
    pub stdout: String,
    pub stderr: String,
}

/// One cached output file.
#[derive(Debug, Clone, Facet)]
pub struct CachedOutput {
    /// Output path relative to the compile's cwd (e.g. `obj/a.o`)
    pub path: String,
    pub executable: bool,
    pub blob: ContentHash,
}

#[derive(Debug, Clone, Facet)]
struct IndexEntry {
    key: ContentHash,
    outputs: Vec<CachedOutput>,
    /// Compiler diagnostics replayed on a hit, so cached warnings still
    /// show up in the build log
    stdout: String,
    stderr: String,
    bytes: u64,
    last_used: u64,
}

#[derive(Debug, Clone, Facet, Default)]
struct IndexFile {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<Fingerprint, IndexEntry>,
    total_bytes: u64,
    tick: u64,
}

/// The cache. One instance per daemon.
pub struct OutputCache {
    root: Utf8PathBuf,
    max_bytes: u64,
    state: Mutex<State>,
}

impl OutputCache {
    /// Open (or create) the cache at `root`.
    pub async fn open(root: Utf8PathBuf, max_bytes: u64) -> Result<Self, OutputCacheError> {
        tokio::fs::create_dir_all(root.join("blobs")).await?;

        let mut state = State::default();
        let index_path = root.join("index");
        if let Ok(raw) = tokio::fs::read_to_string(&index_path).await {
            if let Ok(index) = facet_json::from_str::<IndexFile>(&raw) {
                for entry in index.entries {
                    state.tick = state.tick.max(entry.last_used);
                    state.total_bytes += entry.bytes;
                    state.entries.insert(entry.key, entry);
                }
            }
        }

        info!(
            root = %root,
            entries = state.entries.len(),
            bytes = state.total_bytes,
            "local output cache opened"
        );

        Ok(Self {
            root,
            max_bytes,
            state: Mutex::new(state),
        })
    }

    fn blob_path(&self, hash: &ContentHash) -> Utf8PathBuf {
        let hex = hash.to_hex();
        self.root.join("blobs").join(&hex[..2]).join(&hex)
    }

    /// Look up a compile fingerprint. Returns output metadata plus the blob
    /// paths to copy from. A hit with missing blobs invalidates the entry.
    pub async fn lookup(&self, key: &Fingerprint) -> Option<CacheHitEntry> {
        let (outputs, stdout, stderr) = {
            let mut state = self.state.lock().unwrap();
            state.tick += 1;
            let tick = state.tick;
            let entry = state.entries.get_mut(key)?;
            entry.last_used = tick;
            (entry.outputs.clone(), entry.stdout.clone(), entry.stderr.clone())
        };

        let mut found = Vec::with_capacity(outputs.len());
        for output in outputs {
            let path = self.blob_path(&output.blob);
            if !path.exists() {
                debug!(key = %key, blob = %output.blob, "cache entry lost a blob; invalidating");
                self.remove(key).await;
                return None;
            }
            found.push((output, path));
        }
        Some(CacheHitEntry {
            outputs: found,
            stdout,
            stderr,
        })
    }

    /// Publish outputs for a fingerprint. Content is written content-
    /// addressed (shared across entries) and made visible by atomic rename.
    pub async fn put(
        &self,
        key: Fingerprint,
        outputs: &[(String, Vec<u8>, bool)],
        stdout: &str,
        stderr: &str,
    ) -> Result<(), OutputCacheError> {
        let mut cached = Vec::with_capacity(outputs.len());
        let mut bytes = 0u64;

        for (path, content, executable) in outputs {
            let blob = ContentHash::of_bytes(content);
            let blob_path = self.blob_path(&blob);
            if !blob_path.exists() {
                lx_io::atomic_write(&blob_path, content).await?;
            }
            bytes += content.len() as u64;
            cached.push(CachedOutput {
                path: path.clone(),
                executable: *executable,
                blob,
            });
        }

        let (evicted_blobs, index) = {
            let mut state = self.state.lock().unwrap();
            state.tick += 1;
            let tick = state.tick;

            if let Some(old) = state.entries.insert(
                key,
                IndexEntry {
                    key,
                    outputs: cached,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    bytes,
                    last_used: tick,
                },
            ) {
                state.total_bytes -= old.bytes;
            }
            state.total_bytes += bytes;

            let evicted = evict_to_budget(&mut state, self.max_bytes);
            (evicted, snapshot(&state))
        };

        for blob in evicted_blobs {
            let _ = tokio::fs::remove_file(self.blob_path(&blob)).await;
        }
        self.persist(index).await?;
        Ok(())
    }

    /// Drop one entry, deleting blobs no other entry shares.
    pub async fn remove(&self, key: &Fingerprint) {
        let (unreferenced, index) = {
            let mut state = self.state.lock().unwrap();
            let Some(entry) = state.entries.remove(key) else {
                return;
            };
            state.total_bytes -= entry.bytes;
            let blobs = unreferenced_blobs(&state, &entry);
            (blobs, snapshot(&state))
        };

        for blob in unreferenced {
            let _ = tokio::fs::remove_file(self.blob_path(&blob)).await;
        }
        let _ = self.persist(index).await;
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    async fn persist(&self, index: IndexFile) -> Result<(), OutputCacheError> {
        let json = facet_json::to_string(&index);
        lx_io::atomic_write(&self.root.join("index"), json.as_bytes()).await?;
        Ok(())
    }
}

fn snapshot(state: &State) -> IndexFile {
    IndexFile {
        entries: state.entries.values().cloned().collect(),
    }
}

/// Pop least-recently-used entries until the budget holds. Returns blobs
/// that lost their last reference.
fn evict_to_budget(state: &mut State, max_bytes: u64) -> Vec<ContentHash> {
    let mut victims = Vec::new();
    while state.total_bytes > max_bytes && state.entries.len() > 1 {
        let Some(oldest) = state
            .entries
            .values()
            .min_by_key(|e| e.last_used)
            .map(|e| e.key)
        else {
            break;
        };
        let entry = state.entries.remove(&oldest).expect("entry exists");
        state.total_bytes -= entry.bytes;
        debug!(key = %oldest, bytes = entry.bytes, "evicting output cache entry");
        victims.extend(unreferenced_blobs(state, &entry));
    }
    victims
}

fn unreferenced_blobs(state: &State, removed: &IndexEntry) -> Vec<ContentHash> {
    removed
        .outputs
        .iter()
        .map(|o| o.blob)
        .filter(|blob| {
            !state
                .entries
                .values()
                .any(|e| e.outputs.iter().any(|o| o.blob == *blob))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
    }

    fn key(tag: &[u8]) -> Fingerprint {
        ContentHash::of_bytes(tag)
    }

    #[tokio::test]
    async fn put_then_lookup_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OutputCache::open(root(&dir), 1 << 20).await.unwrap();

        cache
            .put(
                key(b"k1"),
                &[("a.o".to_string(), b"object".to_vec(), false)],
                "",
                "warning: shadowed\n",
            )
            .await
            .unwrap();

        let hit = cache.lookup(&key(b"k1")).await.unwrap();
        assert_eq!(hit.outputs.len(), 1);
        assert_eq!(hit.outputs[0].0.path, "a.o");
        let content = tokio::fs::read(&hit.outputs[0].1).await.unwrap();
        assert_eq!(content, b"object");
        // diagnostics replay with the hit
        assert_eq!(hit.stderr, "warning: shadowed\n");

        assert!(cache.lookup(&key(b"other")).await.is_none());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = OutputCache::open(root(&dir), 1 << 20).await.unwrap();
            cache
                .put(
                    key(b"k1"),
                    &[("a.o".to_string(), b"object".to_vec(), false)],
                    "",
                    "",
                )
                .await
                .unwrap();
        }
        let cache = OutputCache::open(root(&dir), 1 << 20).await.unwrap();
        assert_eq!(cache.entry_count(), 1);
        assert!(cache.lookup(&key(b"k1")).await.is_some());
    }

    #[tokio::test]
    async fn lru_eviction_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        // room for two 8-byte entries, not three
        let cache = OutputCache::open(root(&dir), 20).await.unwrap();

        cache
            .put(key(b"old"), &[("a.o".to_string(), vec![1u8; 8], false)], "", "")
            .await
            .unwrap();
        cache
            .put(key(b"mid"), &[("b.o".to_string(), vec![2u8; 8], false)], "", "")
            .await
            .unwrap();
        // refresh "old" so "mid" becomes the LRU victim
        cache.lookup(&key(b"old")).await.unwrap();
        cache
            .put(key(b"new"), &[("c.o".to_string(), vec![3u8; 8], false)], "", "")
            .await
            .unwrap();

        assert!(cache.total_bytes() <= 20);
        assert!(cache.lookup(&key(b"mid")).await.is_none());
        assert!(cache.lookup(&key(b"new")).await.is_some());
    }

    #[tokio::test]
    async fn missing_blob_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OutputCache::open(root(&dir), 1 << 20).await.unwrap();
        cache
            .put(key(b"k"), &[("a.o".to_string(), b"bytes".to_vec(), false)], "", "")
            .await
            .unwrap();

        let hit = cache.lookup(&key(b"k")).await.unwrap();
        tokio::fs::remove_file(&hit.outputs[0].1).await.unwrap();

        assert!(cache.lookup(&key(b"k")).await.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn shared_blobs_survive_sibling_removal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OutputCache::open(root(&dir), 1 << 20).await.unwrap();
        let content = b"same bytes".to_vec();
        cache
            .put(key(b"k1"), &[("a.o".to_string(), content.clone(), false)], "", "")
            .await
            .unwrap();
        cache
            .put(key(b"k2"), &[("b.o".to_string(), content, false)], "", "")
            .await
            .unwrap();

        cache.remove(&key(b"k1")).await;
        // k2 still resolves: the shared blob must not have been deleted
        assert!(cache.lookup(&key(b"k2")).await.is_some());
    }

    #[test]
    fn cache_key_depends_on_inputs() {
        let compiler = ContentHash::of_bytes(b"cc");
        let args = vec!["-c".to_string(), "a.cc".to_string()];
        let k1 = output_cache_key(
            &compiler,
            &args,
            &[("a.cc".to_string(), ContentHash::of_bytes(b"v1"))],
        );
        let k2 = output_cache_key(
            &compiler,
            &args,
            &[("a.cc".to_string(), ContentHash::of_bytes(b"v2"))],
        );
        assert_ne!(k1, k2);

        // input order must not matter
        let h1 = ("x.h".to_string(), ContentHash::of_bytes(b"x"));
        let h2 = ("y.h".to_string(), ContentHash::of_bytes(b"y"));
        let ka = output_cache_key(&compiler, &args, &[h1.clone(), h2.clone()]);
        let kb = output_cache_key(&compiler, &args, &[h2, h1]);
        assert_eq!(ka, kb);
    }
}
