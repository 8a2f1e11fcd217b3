//! Include search paths.
//!
//! Quote, system, and after directories form one unified chain; searches
//! remember the index a file was found at so `#include_next` can resume from
//! the following directory.

use camino::{Utf8Path, Utf8PathBuf};
use lx_deps::FileStatCache;

#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    /// `-iquote` directories, searched only for `"..."` includes
    pub quote: Vec<Utf8PathBuf>,
    /// `-I` / `-isystem` directories
    pub system: Vec<Utf8PathBuf>,
    /// `-idirafter` directories, searched last
    pub after: Vec<Utf8PathBuf>,
}

impl SearchPaths {
    /// All directories in search order.
    pub fn dirs(&self) -> impl Iterator<Item = &Utf8PathBuf> {
        self.quote
            .iter()
            .chain(self.system.iter())
            .chain(self.after.iter())
    }

    /// Index where `<...>` searches begin (quote dirs are skipped).
    pub fn angle_start(&self) -> usize {
        self.quote.len()
    }

    /// Find `name` in the unified chain starting at `start`. Returns the
    /// joined path and the directory index it was found at.
    pub fn find_from(
        &self,
        name: &Utf8Path,
        start: usize,
        stat_cache: &FileStatCache,
    ) -> Option<(Utf8PathBuf, usize)> {
        for (index, dir) in self.dirs().enumerate().skip(start) {
            let candidate = dir.join(name);
            if stat_cache.get(&candidate).exists {
                return Some((candidate, index));
            }
        }
        None
    }

    /// Stable hash of the configuration; part of the memo key, since a
    /// cached resolution is only valid under the same search chain.
    pub fn config_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        for (tag, group) in [
            (b"q:" as &[u8], &self.quote),
            (b"s:", &self.system),
            (b"a:", &self.after),
        ] {
            for dir in group {
                hasher.update(tag);
                hasher.update(dir.as_str().as_bytes());
                hasher.update(b"\n");
            }
        }
        u64::from_le_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap())
    }
}
