//! Table commit log.
//!
//! `_log/` holds one JSON file per version. A version exists once its log
//! file exists; data files not referenced by any log entry are leftovers of
//! an interrupted append and are never read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::TableError;
use crate::durable;

/// A single committed append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    /// Table version (0-based, contiguous)
    pub version: u64,

    /// Unique id of this commit attempt
    pub commit_id: Uuid,

    /// Writer that produced the commit (a stage checkpoint id)
    pub writer: String,

    /// Writer's batch number; `(writer, batch_id)` is unique per table
    pub batch_id: u64,

    pub committed_at: DateTime<Utc>,

    pub row_count: usize,

    /// Data files in write order
    pub files: Vec<DataFile>,
}

/// A JSON Lines data file belonging to one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Path relative to the table root, `/`-separated
    pub path: String,

    /// Partition column values
    pub partition: BTreeMap<String, String>,

    pub rows: usize,
}

pub(super) fn log_file_name(version: u64) -> String {
    format!("{:020}.json", version)
}

fn parse_log_file_name(name: &str) -> Option<u64> {
    if !durable::is_published(name) {
        return None;
    }
    name.strip_suffix(".json")?.parse().ok()
}

/// Versions present in the log directory, ascending
pub(super) async fn list_versions(log_dir: &Path) -> Result<Vec<u64>, TableError> {
    let mut versions = Vec::new();

    let mut entries = fs::read_dir(log_dir)
        .await
        .map_err(|e| TableError::io(log_dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| TableError::io(log_dir, e))?
    {
        if let Some(version) = entry.file_name().to_str().and_then(parse_log_file_name) {
            versions.push(version);
        }
    }

    versions.sort_unstable();
    Ok(versions)
}

pub(super) async fn read_entry(log_dir: &Path, version: u64) -> Result<CommitEntry, TableError> {
    let path = log_dir.join(log_file_name(version));
    let content = fs::read(&path).await.map_err(|e| TableError::io(&path, e))?;

    serde_json::from_slice(&content).map_err(|source| TableError::Serialization { path, source })
}

/// Publish a log entry; `Ok(false)` if its version is already taken
pub(super) async fn publish_entry(
    log_dir: &Path,
    entry: &CommitEntry,
) -> Result<bool, TableError> {
    let path: PathBuf = log_dir.join(log_file_name(entry.version));
    let json = serde_json::to_vec_pretty(entry).map_err(|source| TableError::Serialization {
        path: path.clone(),
        source,
    })?;

    durable::publish_new(&path, &json)
        .await
        .map_err(|e| TableError::io(&path, e))
}
