//! Local-filesystem volume.
//!
//! Paths are absolute filesystem paths. Listing walks the prefix recursively
//! and skips hidden entries (`.` or `_` prefixed), which covers in-flight
//! uploads and tool metadata. Dangling symlinks are listed so that ingest
//! reports them as dead letters instead of skipping them forever.

use std::fs::Metadata;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{FileEntry, ObjectStore, PathGlobFilter, StorageError, StorageResult};

/// Object store backed by a mounted directory
#[derive(Debug, Clone, Default)]
pub struct LocalVolume;

impl LocalVolume {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ObjectStore for LocalVolume {
    fn name(&self) -> &str {
        "local"
    }

    async fn list(&self, prefix: &str, filter: &PathGlobFilter) -> StorageResult<Vec<FileEntry>> {
        let root = PathBuf::from(prefix);
        let root_meta = fs::metadata(&root)
            .await
            .map_err(|e| StorageError::from_io(prefix, e))?;

        if !root_meta.is_dir() {
            return Err(StorageError::NotFound(prefix.to_string()));
        }

        let mut pending_dirs = vec![root];
        let mut entries = Vec::new();

        while let Some(dir) = pending_dirs.pop() {
            let mut read_dir = fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::from_io(path_string(&dir), e))?;

            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| StorageError::from_io(path_string(&dir), e))?
            {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if is_hidden(&name) {
                    continue;
                }

                let path = entry.path();
                let metadata = match fs::metadata(&path).await {
                    Ok(m) => m,
                    Err(e) => {
                        // A dangling link is listed under its own mtime so ingest dead-letters it
                        if let Some(link) = dangling_link(&path).await {
                            if filter.matches(&name) {
                                entries.push(entry_from_metadata(path_string(&path), &link)?);
                            }
                            continue;
                        }

                        // Vanished or unreadable between readdir and stat; picked up next trigger
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Skipping unreadable entry"
                        );
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending_dirs.push(path);
                    continue;
                }

                if !metadata.is_file() || !filter.matches(&name) {
                    continue;
                }

                entries.push(entry_from_metadata(path_string(&path), &metadata)?);
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> StorageResult<FileEntry> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| StorageError::from_io(path, e))?;

        if !metadata.is_file() {
            return Err(StorageError::InvalidData {
                path: path.to_string(),
                message: "not a regular file".to_string(),
            });
        }

        entry_from_metadata(path.to_string(), &metadata)
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.stat(path).await?;
        fs::read(path).await.map_err(|e| StorageError::from_io(path, e))
    }
}

async fn dangling_link(path: &Path) -> Option<Metadata> {
    fs::symlink_metadata(path)
        .await
        .ok()
        .filter(|m| m.file_type().is_symlink())
}

fn entry_from_metadata(path: String, metadata: &Metadata) -> StorageResult<FileEntry> {
    let modified = metadata
        .modified()
        .map_err(|e| StorageError::from_io(path.clone(), e))?;

    Ok(FileEntry {
        path,
        modification_time: DateTime::<Utc>::from(modified),
        length: metadata.len(),
    })
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn audio_filter() -> PathGlobFilter {
        PathGlobFilter::new("*.{wav,mp3,flac,m4a,ogg,mp4}").unwrap()
    }

    #[tokio::test]
    async fn test_list_filters_and_recurses() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("2026/10");
        tokio::fs::create_dir_all(&nested).await.unwrap();

        tokio::fs::write(temp.path().join("a.wav"), b"riff").await.unwrap();
        tokio::fs::write(temp.path().join("notes.txt"), b"text").await.unwrap();
        tokio::fs::write(temp.path().join(".b.wav"), b"hidden").await.unwrap();
        tokio::fs::write(temp.path().join("_c.wav"), b"staging").await.unwrap();
        tokio::fs::write(nested.join("d.MP3"), b"id3").await.unwrap();

        let volume = LocalVolume::new();
        let prefix = temp.path().to_string_lossy().to_string();
        let entries = volume.list(&prefix, &audio_filter()).await.unwrap();

        let names: Vec<&str> = entries
            .iter()
            .map(|e| crate::domain::file_name(&e.path))
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(names.contains(&"a.wav"));
        assert!(names.contains(&"d.MP3"));

        let a = entries.iter().find(|e| e.path.ends_with("a.wav")).unwrap();
        assert_eq!(a.length, 4);
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_not_found() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope").to_string_lossy().to_string();

        let err = LocalVolume::new()
            .list(&missing, &audio_filter())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat_and_read() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.wav");
        tokio::fs::write(&file, b"payload").await.unwrap();
        let path = file.to_string_lossy().to_string();

        let volume = LocalVolume::new();
        let entry = volume.stat(&path).await.unwrap();
        assert_eq!(entry.length, 7);
        assert_eq!(volume.read(&path).await.unwrap(), b"payload");

        tokio::fs::remove_file(&file).await.unwrap();
        let err = volume.read(&path).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_read_of_directory_is_invalid_data() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("a.wav");
        tokio::fs::create_dir(&dir).await.unwrap();

        let err = LocalVolume::new()
            .read(&dir.to_string_lossy())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidData { .. }));
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dangling_link_is_listed_and_fails_permanently() {
        let temp = TempDir::new().unwrap();
        let link = temp.path().join("gone.wav");
        std::os::unix::fs::symlink(temp.path().join("missing.wav"), &link).unwrap();

        let volume = LocalVolume::new();
        let prefix = temp.path().to_string_lossy().to_string();
        let entries = volume.list(&prefix, &audio_filter()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.ends_with("gone.wav"));

        let err = volume.stat(&entries[0].path).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
