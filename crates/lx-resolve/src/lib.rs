//! Include resolver
//!
//! Evaluates a file's directive list under a macro environment and a
//! search-path configuration, walking the transitive include graph to
//! enumerate every file a compile reads. This is what lets the proxy upload
//! exactly the right input set without ever running the real preprocessor.
//!
//! The resolver is CPU-bound and never suspends; compile tasks run it on a
//! blocking worker.

mod cache;
mod eval;
mod expand;
mod macros;
mod resolver;
mod search;

pub use cache::{DirectiveCache, IncludeMemoCache};
pub use eval::eval_condition;
pub use macros::{MacroDef, MacroEnv, ReadTracker};
pub use resolver::{resolve, ResolveOptions, Resolved};
pub use search::SearchPaths;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("include not found: {0}")]
    IncludeNotFound(String),

    #[error("directive parse error: {0}")]
    ParseError(String),

    #[error("scan failed for {path}: {source}")]
    Scan {
        path: camino::Utf8PathBuf,
        source: lx_scan::ScanError,
    },

    #[error("cannot read {path}: {source}")]
    Io {
        path: camino::Utf8PathBuf,
        source: std::io::Error,
    },
}
