//! Per-stage write-ahead checkpoints.
//!
//! A checkpoint directory looks like:
//!
//! ```text
//! bronze/
//! ├── metadata.json      {id, stage, created_at}
//! ├── offsets/0          planned input of batch 0
//! ├── commits/0          batch 0 is durable downstream
//! ├── attempts/0         runs of batch 0 so far
//! ├── state/snapshot.json
//! └── .lock
//! ```
//!
//! `offsets/N` is written before a batch touches any table and `commits/N`
//! only after its rows are durable. An offset without a commit is a pending
//! batch that must be re-run with exactly the same input. `attempts/N` counts
//! those runs so a stage can stop retrying inputs that keep failing.

pub mod discovery;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::durable;

pub use discovery::{DiscoveryOffset, FileDiscoveryCheckpoint};

const METADATA_FILE: &str = "metadata.json";
const OFFSETS_DIR: &str = "offsets";
const COMMITS_DIR: &str = "commits";
const ATTEMPTS_DIR: &str = "attempts";
const SNAPSHOT_FILE: &str = "state/snapshot.json";
const LOCK_FILE: &str = ".lock";

/// Checkpoint errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint {0} is locked by another process")]
    Locked(PathBuf),

    #[error("IO error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt checkpoint file {path}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint {path} belongs to stage '{found}', not '{expected}'")]
    StageMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

impl CheckpointError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Identity of a checkpoint, written once at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: Uuid,
    pub stage: String,
    pub created_at: DateTime<Utc>,
}

/// The planned input of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetEntry<O> {
    pub batch_id: u64,
    pub planned_at: DateTime<Utc>,
    pub offset: O,
}

/// Marker written once a batch is durable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    pub batch_id: u64,
    pub committed_at: DateTime<Utc>,

    /// Rows appended to the stage's output table
    pub records: usize,

    /// Rows appended to the dead-letter table
    #[serde(default)]
    pub dead_letters: usize,

    /// Input rows filtered out
    #[serde(default)]
    pub dropped: usize,
}

/// An open, exclusively locked stage checkpoint
#[derive(Debug)]
pub struct StreamCheckpoint {
    root: PathBuf,
    metadata: CheckpointMetadata,

    // Held for the lifetime of the checkpoint; the lock is released on drop
    _lock: std::fs::File,
}

impl StreamCheckpoint {
    /// Open (creating if needed) the checkpoint at `root` for `stage`.
    ///
    /// Fails with [`CheckpointError::Locked`] if another process holds it.
    pub async fn open(root: &Path, stage: &str) -> Result<Self, CheckpointError> {
        for dir in [
            root.join(OFFSETS_DIR),
            root.join(COMMITS_DIR),
            root.join(ATTEMPTS_DIR),
            root.join("state"),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| CheckpointError::io(&dir, e))?;
        }

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CheckpointError::io(&lock_path, e))?;

        lock.try_lock_exclusive()
            .map_err(|_| CheckpointError::Locked(root.to_path_buf()))?;

        let metadata = match read_metadata(root).await? {
            Some(existing) if existing.stage != stage => {
                return Err(CheckpointError::StageMismatch {
                    path: root.to_path_buf(),
                    expected: stage.to_string(),
                    found: existing.stage,
                });
            }
            Some(existing) => existing,
            None => {
                let created = CheckpointMetadata {
                    id: Uuid::new_v4(),
                    stage: stage.to_string(),
                    created_at: Utc::now(),
                };
                write_json(&root.join(METADATA_FILE), &created).await?;
                tracing::info!(stage, id = %created.id, "Created checkpoint");
                created
            }
        };

        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    /// Writer id stamped on table commits
    pub fn writer_id(&self) -> String {
        self.metadata.id.to_string()
    }

    pub async fn latest_offset_id(&self) -> Result<Option<u64>, CheckpointError> {
        Ok(list_batches(&self.root.join(OFFSETS_DIR)).await?.last().copied())
    }

    pub async fn latest_commit_id(&self) -> Result<Option<u64>, CheckpointError> {
        Ok(list_batches(&self.root.join(COMMITS_DIR)).await?.last().copied())
    }

    /// Committed batch ids, ascending
    pub async fn committed_batches(&self) -> Result<Vec<u64>, CheckpointError> {
        list_batches(&self.root.join(COMMITS_DIR)).await
    }

    pub async fn read_offset<O: DeserializeOwned>(
        &self,
        batch_id: u64,
    ) -> Result<Option<OffsetEntry<O>>, CheckpointError> {
        read_json(&self.root.join(OFFSETS_DIR).join(batch_id.to_string())).await
    }

    pub async fn read_commit(
        &self,
        batch_id: u64,
    ) -> Result<Option<CommitMarker>, CheckpointError> {
        read_json(&self.root.join(COMMITS_DIR).join(batch_id.to_string())).await
    }

    /// The latest planned batch if it was never committed
    pub async fn pending_batch<O: DeserializeOwned>(
        &self,
    ) -> Result<Option<OffsetEntry<O>>, CheckpointError> {
        let Some(latest) = self.latest_offset_id().await? else {
            return Ok(None);
        };

        if self.latest_commit_id().await? >= Some(latest) {
            return Ok(None);
        }

        self.read_offset(latest).await
    }

    /// Id for the next batch to plan
    pub async fn next_batch_id(&self) -> Result<u64, CheckpointError> {
        Ok(self.latest_offset_id().await?.map(|id| id + 1).unwrap_or(0))
    }

    /// Durably record the planned input of a batch
    pub async fn write_offset<O: Serialize>(
        &self,
        batch_id: u64,
        offset: O,
    ) -> Result<OffsetEntry<O>, CheckpointError> {
        let entry = OffsetEntry {
            batch_id,
            planned_at: Utc::now(),
            offset,
        };
        write_json(&self.root.join(OFFSETS_DIR).join(batch_id.to_string()), &entry).await?;
        Ok(entry)
    }

    /// Durably mark a batch as complete
    pub async fn commit(&self, marker: &CommitMarker) -> Result<(), CheckpointError> {
        let path = self.root.join(COMMITS_DIR).join(marker.batch_id.to_string());
        write_json(&path, marker).await
    }

    /// Count one more run of `batch_id` and return the total so far
    pub async fn record_attempt(&self, batch_id: u64) -> Result<u32, CheckpointError> {
        let path = self.root.join(ATTEMPTS_DIR).join(batch_id.to_string());
        let attempts = read_json::<u32>(&path).await?.unwrap_or(0) + 1;
        write_json(&path, &attempts).await?;
        Ok(attempts)
    }

    pub async fn read_state<S: DeserializeOwned>(&self) -> Result<Option<S>, CheckpointError> {
        read_json(&self.root.join(SNAPSHOT_FILE)).await
    }

    pub async fn write_state<S: Serialize>(&self, state: &S) -> Result<(), CheckpointError> {
        write_json(&self.root.join(SNAPSHOT_FILE), state).await
    }
}

/// Read-only view of a checkpoint, taken without the lock
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointStatus {
    pub metadata: CheckpointMetadata,
    pub latest_offset: Option<u64>,
    pub latest_commit: Option<u64>,
    pub last_committed_at: Option<DateTime<Utc>>,
}

impl CheckpointStatus {
    /// `None` if no checkpoint exists at `root`
    pub async fn inspect(root: &Path) -> Result<Option<Self>, CheckpointError> {
        let Some(metadata) = read_metadata(root).await? else {
            return Ok(None);
        };

        let latest_offset = list_batches(&root.join(OFFSETS_DIR)).await?.last().copied();
        let latest_commit = list_batches(&root.join(COMMITS_DIR)).await?.last().copied();

        let last_committed_at = match latest_commit {
            Some(id) => read_json::<CommitMarker>(&root.join(COMMITS_DIR).join(id.to_string()))
                .await?
                .map(|m| m.committed_at),
            None => None,
        };

        Ok(Some(Self {
            metadata,
            latest_offset,
            latest_commit,
            last_committed_at,
        }))
    }

    /// A batch was planned but never committed
    pub fn has_pending_batch(&self) -> bool {
        match (self.latest_offset, self.latest_commit) {
            (Some(offset), Some(commit)) => offset > commit,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

async fn read_metadata(root: &Path) -> Result<Option<CheckpointMetadata>, CheckpointError> {
    read_json(&root.join(METADATA_FILE)).await
}

async fn list_batches(dir: &Path) -> Result<Vec<u64>, CheckpointError> {
    let mut ids = Vec::new();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(CheckpointError::io(dir, e)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CheckpointError::io(dir, e))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !durable::is_published(&name) {
            continue;
        }
        if let Ok(id) = name.parse::<u64>() {
            ids.push(id);
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io(path, e)),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    durable::write_atomic(path, &json)
        .await
        .map_err(|e| CheckpointError::io(path, e))
}
