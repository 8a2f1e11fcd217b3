//! Common I/O utilities for lynx crates

pub mod net;

use camino::Utf8Path;

/// Atomically write contents to a file.
///
/// Creates a temporary file in the same directory, writes contents,
/// then atomically renames to the final path. This ensures the file
/// is never partially written.
pub async fn atomic_write(path: &Utf8Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let parent_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));

    tokio::fs::create_dir_all(parent_dir).await?;

    // Temporary file in the same directory so the rename stays on one filesystem
    let temp_file = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent_dir)
        .map_err(std::io::Error::other)?;

    let temp_path = temp_file.into_temp_path();
    tokio::fs::write(&temp_path, contents).await?;

    temp_path
        .persist(path)
        .map_err(|e| std::io::Error::other(format!("failed to persist temp file: {}", e)))?;

    Ok(())
}

/// Atomically write contents to a file, optionally making it executable.
pub async fn atomic_write_executable(
    path: &Utf8Path,
    contents: &[u8],
    executable: bool,
) -> Result<(), std::io::Error> {
    let parent_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));

    tokio::fs::create_dir_all(parent_dir).await?;

    let temp_file = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent_dir)
        .map_err(std::io::Error::other)?;

    let temp_path = temp_file.into_temp_path();
    tokio::fs::write(&temp_path, contents).await?;

    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&temp_path).await?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        tokio::fs::set_permissions(&temp_path, perms).await?;
    }
    #[cfg(not(unix))]
    let _ = executable;

    temp_path
        .persist(path)
        .map_err(|e| std::io::Error::other(format!("failed to persist temp file: {}", e)))?;

    Ok(())
}

/// Read a whole file and hash it in one pass.
///
/// Returns (content, blake3 of content). The daemon embeds input files into
/// the exec request, so whole-file reads are the common case.
pub async fn read_and_hash(path: &Utf8Path) -> Result<(Vec<u8>, blake3::Hash), std::io::Error> {
    let content = tokio::fs::read(path).await?;
    let hash = blake3::hash(&content);
    Ok((content, hash))
}

/// Synchronous versions for use in blocking contexts.
pub mod sync {
    use camino::Utf8Path;
    use std::io::Write;

    /// Atomically write contents to a file.
    pub fn atomic_write(path: &Utf8Path, contents: &[u8]) -> Result<(), std::io::Error> {
        let parent_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
        std::fs::create_dir_all(parent_dir)?;

        let temp_file = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent_dir)
            .map_err(std::io::Error::other)?;

        let (mut file, temp_path) = temp_file.into_parts();
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        temp_path
            .persist(path)
            .map_err(|e| std::io::Error::other(format!("failed to persist temp file: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[tokio::test]
    async fn atomic_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("a/b/c.txt")).unwrap();
        atomic_write(&path, b"hello").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("f.txt")).unwrap();
        atomic_write(&path, b"one").await.unwrap();
        atomic_write(&path, b"two").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn read_and_hash_matches_direct_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("f.txt")).unwrap();
        tokio::fs::write(&path, b"contents").await.unwrap();
        let (content, hash) = read_and_hash(&path).await.unwrap();
        assert_eq!(content, b"contents");
        assert_eq!(hash, blake3::hash(b"contents"));
    }
}
