//! Local compiler validation and discovery.

use camino::{Utf8Path, Utf8PathBuf};
use lx_proto::{CompilerIdentity, ContentHash};

/// Locate a compiler named in the request. Relative names are resolved
/// through `PATH`, the way the shell would have.
pub fn find_local_compiler(name: &Utf8Path, cwd: &Utf8Path) -> Option<Utf8PathBuf> {
    if name.is_absolute() {
        return name.is_file().then(|| name.to_owned());
    }
    if name.as_str().contains('/') {
        let joined = cwd.join(name);
        return joined.is_file().then_some(joined);
    }

    let path_var = std::env::var("PATH").ok()?;
    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Utf8PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Result of validating the request's compiler identity against the local
/// binary.
#[derive(Debug, PartialEq, Eq)]
pub enum CompilerCheck {
    /// Path exists and the content hash matches the request
    Valid,
    /// Path exists but its bytes differ from what the caller hashed;
    /// shipping this compile remotely would use the wrong toolchain
    HashMismatch,
    Missing,
}

/// Validate the local compiler path named by the intake request.
pub fn validate_compiler(identity: &CompilerIdentity, cwd: &Utf8Path) -> CompilerCheck {
    let Some(path) = find_local_compiler(Utf8Path::new(&identity.path), cwd) else {
        return CompilerCheck::Missing;
    };
    let Ok(content) = std::fs::read(&path) else {
        return CompilerCheck::Missing;
    };
    if ContentHash::of_bytes(&content) == identity.content_hash {
        CompilerCheck::Valid
    } else {
        CompilerCheck::HashMismatch
    }
}
