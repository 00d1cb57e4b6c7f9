//! Crash-safe file publication.
//!
//! Every file the pipeline relies on for recovery is written under a hidden
//! temporary name, synced, and only then published under its final name.
//! Readers skip names starting with `.`, so a crash mid-write never exposes a
//! torn file. The parent directory is synced after publishing, so a name is
//! on disk before anything that depends on it is written.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Write `bytes` to `path`, replacing any previous content atomically
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);
    write_synced(&tmp, bytes).await?;

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    sync_parent(path).await
}

/// Publish `bytes` at `path` only if nothing exists there yet.
///
/// Returns `false` when another file already holds the name. Used for table
/// log entries, where a version must never be overwritten.
pub async fn publish_new(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let tmp = temp_sibling(path);
    write_synced(&tmp, bytes).await?;

    let linked = fs::hard_link(&tmp, path).await;
    let _ = fs::remove_file(&tmp).await;

    match linked {
        Ok(()) => {
            sync_parent(path).await?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether a directory entry is a published file (not a temp or hidden file)
pub fn is_published(name: &str) -> bool {
    !name.starts_with('.')
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Flush the directory entry for `path`
#[cfg(unix)]
pub async fn sync_parent(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir).await?.sync_all().await
}

/// No-op where a directory cannot be opened as a file
#[cfg(not(unix))]
pub async fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{}.tmp-{}", name, Uuid::new_v4().simple());

    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}
