//! Directive-level C/C++ scanner
//!
//! Produces the ordered list of preprocessor directives from a source file
//! without running a full preprocessor:
//! - [`filter`] strips comments, keeps only directive lines, folds escaped
//!   newlines, and prunes directives that cannot affect the include set
//! - [`tokenizer`] lexes preprocessing tokens (pp-numbers, operators,
//!   strings, digraphs) with line-folding support
//! - [`parser`] classifies directive names through a double-array trie and
//!   builds the canonical [`DirectiveList`]
//!
//! The byte-search inner loops use `memchr` (SIMD on every platform that has
//! it); the scalar tails preserve identical semantics.

pub mod darray;
pub mod directive;
pub mod filter;
pub mod parser;
pub mod stream;
pub mod token;
pub mod tokenizer;

pub use directive::{Directive, DirectiveList, IncludePath, MacroParams};
pub use parser::scan_directives;
pub use token::Token;

use thiserror::Error;

/// Errors produced while scanning raw bytes. Directive-level parse problems
/// do not abort the scan; they become [`Directive::Error`] records instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("missing terminating '*/' for comment")]
    UnterminatedComment,

    #[error("missing terminating '{0}' character")]
    UnterminatedDelimiter(char),
}
