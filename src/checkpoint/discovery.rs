//! Which files discovery has already seen.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CheckpointError, StreamCheckpoint};
use crate::storage::FileEntry;

/// Planned input of a bronze batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOffset {
    pub files: Vec<FileEntry>,
}

/// Path to the last modification time ingested for it.
///
/// Built from the latest snapshot plus the committed offsets after it, so
/// uncommitted batches never count as discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiscoveryCheckpoint {
    /// Last batch folded in
    pub through_batch: Option<u64>,

    seen: HashMap<String, DateTime<Utc>>,
}

impl FileDiscoveryCheckpoint {
    pub async fn load(checkpoint: &StreamCheckpoint) -> Result<Self, CheckpointError> {
        let mut state: Self = checkpoint.read_state().await?.unwrap_or_default();
        let snapshot_through = state.through_batch;

        let mut replayed = 0usize;
        for batch_id in checkpoint.committed_batches().await? {
            if snapshot_through.map_or(false, |through| batch_id <= through) {
                continue;
            }

            match checkpoint.read_offset::<DiscoveryOffset>(batch_id).await? {
                Some(entry) => {
                    state.apply(batch_id, &entry.offset);
                    replayed += 1;
                }
                None => tracing::warn!(batch_id, "Committed batch has no offset file"),
            }
        }

        tracing::debug!(
            files = state.len(),
            snapshot_through = ?snapshot_through,
            replayed,
            "Loaded discovery state"
        );

        Ok(state)
    }

    /// Whether `entry` has not been ingested at its current modification time
    pub fn is_new(&self, entry: &FileEntry) -> bool {
        self.seen.get(&entry.path) != Some(&entry.modification_time)
    }

    /// Fold a committed batch into the state
    pub fn apply(&mut self, batch_id: u64, offset: &DiscoveryOffset) {
        for file in &offset.files {
            self.seen.insert(file.path.clone(), file.modification_time);
        }
        self.through_batch = Some(batch_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub async fn snapshot(&self, checkpoint: &StreamCheckpoint) -> Result<(), CheckpointError> {
        checkpoint.write_state(self).await?;
        tracing::debug!(
            through_batch = ?self.through_batch,
            files = self.len(),
            "Wrote discovery snapshot"
        );
        Ok(())
    }
}
