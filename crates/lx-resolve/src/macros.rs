//! Macro definitions and the per-resolution macro environment.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use lx_scan::token::render_tokens;
use lx_scan::{MacroParams, Token};

/// One macro definition. Object-like when `params` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroDef {
    pub name: String,
    pub params: Option<MacroParams>,
    pub replacement: Vec<Token>,
}

impl MacroDef {
    pub fn object(name: impl Into<String>, replacement: Vec<Token>) -> Self {
        Self {
            name: name.into(),
            params: None,
            replacement,
        }
    }

    pub fn function(name: impl Into<String>, params: MacroParams, replacement: Vec<Token>) -> Self {
        Self {
            name: name.into(),
            params: Some(params),
            replacement,
        }
    }

    pub fn is_function(&self) -> bool {
        self.params.is_some()
    }

    /// Stable hash of the definition, used to key memoized resolutions on
    /// the macro state they observed.
    pub fn def_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        match self.params {
            None => hasher.update(b"obj\n"),
            Some(p) => {
                hasher.update(b"fn:");
                hasher.update(&(p.count as u64).to_le_bytes());
                hasher.update(&[p.variadic as u8, b'\n'])
            }
        };
        hasher.update(render_tokens(&self.replacement).as_bytes());
        let bytes = hasher.finalize();
        u64::from_le_bytes(bytes.as_bytes()[..8].try_into().unwrap())
    }
}

/// Records which macro names a file's evaluation read from its *incoming*
/// environment, and what state it observed. Names the file itself (re)defined
/// before reading are excluded; those reads do not depend on the caller.
#[derive(Debug, Default)]
pub struct ReadTracker {
    reads: BTreeMap<String, Option<u64>>,
    locally_modified: HashSet<String>,
}

impl ReadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_modified(&mut self, name: &str) {
        self.locally_modified.insert(name.to_string());
    }

    fn note_read(&mut self, name: &str, observed: Option<u64>) {
        if self.locally_modified.contains(name) || self.reads.contains_key(name) {
            return;
        }
        self.reads.insert(name.to_string(), observed);
    }

    /// The tracked (name, observed-state) pairs, sorted by name.
    pub fn into_reads(self) -> Vec<(String, Option<u64>)> {
        self.reads.into_iter().collect()
    }
}

/// Mapping name → definition for one top-level resolution.
#[derive(Debug, Default, Clone)]
pub struct MacroEnv {
    defs: HashMap<String, Arc<MacroDef>>,
}

impl MacroEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_defs(defs: impl IntoIterator<Item = MacroDef>) -> Self {
        let mut env = Self::new();
        for def in defs {
            env.define(def);
        }
        env
    }

    pub fn define(&mut self, def: MacroDef) {
        self.defs.insert(def.name.clone(), Arc::new(def));
    }

    pub fn undef(&mut self, name: &str) {
        self.defs.remove(name);
    }

    /// Raw lookup, no read tracking. Use [`MacroEnv::lookup_tracked`] during
    /// directive evaluation.
    pub fn lookup(&self, name: &str) -> Option<Arc<MacroDef>> {
        self.defs.get(name).cloned()
    }

    pub fn lookup_tracked(
        &self,
        name: &str,
        tracker: &mut ReadTracker,
    ) -> Option<Arc<MacroDef>> {
        let def = self.defs.get(name).cloned();
        tracker.note_read(name, def.as_ref().map(|d| d.def_hash()));
        def
    }

    /// Is `name` defined? Tracks the read.
    pub fn is_defined_tracked(&self, name: &str, tracker: &mut ReadTracker) -> bool {
        self.lookup_tracked(name, tracker).is_some()
    }

    /// The observed state of `name` right now: `None` when undefined,
    /// otherwise the definition hash. Memo validation compares against this.
    pub fn observe(&self, name: &str) -> Option<u64> {
        self.defs.get(name).map(|d| d.def_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn def_hash_distinguishes_definitions() {
        let a = MacroDef::object("A", vec![Token::int(1)]);
        let b = MacroDef::object("A", vec![Token::int(2)]);
        let f = MacroDef::function(
            "A",
            MacroParams {
                count: 1,
                variadic: false,
            },
            vec![Token::int(1)],
        );
        assert_ne!(a.def_hash(), b.def_hash());
        assert_ne!(a.def_hash(), f.def_hash());
    }

    #[test]
    fn tracker_skips_locally_modified_names() {
        let mut env = MacroEnv::new();
        let mut tracker = ReadTracker::new();

        // the file defines X itself, then reads it: not an incoming read
        env.define(MacroDef::object("X", vec![Token::int(1)]));
        tracker.note_modified("X");
        env.lookup_tracked("X", &mut tracker);

        // but a read of Y before any local modification is tracked
        env.lookup_tracked("Y", &mut tracker);

        let reads = tracker.into_reads();
        assert_eq!(reads, vec![("Y".to_string(), None)]);
    }

    #[test]
    fn first_read_wins() {
        let mut env = MacroEnv::new();
        let mut tracker = ReadTracker::new();
        env.lookup_tracked("Z", &mut tracker);
        env.define(MacroDef::object("Z", vec![]));
        env.lookup_tracked("Z", &mut tracker);
        assert_eq!(tracker.into_reads(), vec![("Z".to_string(), None)]);
    }
}
