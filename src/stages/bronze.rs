//! Discovery stage: storage prefix to `bronze_audio_files`.
//!
//! Lists the prefix, keeps entries whose `(path, modification_time)` the
//! discovery state has not seen, and writes one bronze record per entry.
//! Files that cannot be read for a permanent reason go to the dead-letter
//! table and still count as discovered; transient failures that outlast the
//! retry policy fail the whole batch so it is re-run on the next trigger.
//! On the batch's last allowed run (`bronze.max_batch_attempts`) files that
//! still fail are dead-lettered too, so one bad file never blocks the prefix.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{BatchReport, RetryPolicy, Stage};
use crate::checkpoint::{
    CommitMarker, DiscoveryOffset, FileDiscoveryCheckpoint, OffsetEntry, StreamCheckpoint,
};
use crate::config::{paths, BronzeSettings, IngestMode, PipelineConfig};
use crate::domain::{BronzeFileRecord, DeadLetterRecord};
use crate::storage::{FileEntry, ObjectStore, PathGlobFilter, StorageError};
use crate::table::Table;

pub const STAGE_NAME: &str = "bronze";

/// Result of ingesting one planned file
#[derive(Debug)]
enum FileOutcome {
    Ingested(BronzeFileRecord),
    DeadLetter(DeadLetterRecord),
}

/// Incremental file discovery
pub struct DiscoveryStage {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    filter: PathGlobFilter,
    settings: BronzeSettings,
    checkpoint: StreamCheckpoint,
    state: FileDiscoveryCheckpoint,
    bronze: Table<BronzeFileRecord>,
    dead_letters: Table<DeadLetterRecord>,
}

impl DiscoveryStage {
    /// Open the stage's checkpoint (taking its lock) and output tables
    pub async fn open(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let checkpoint_dir = paths::checkpoint_dir(config, paths::BRONZE_TABLE);
        let checkpoint = StreamCheckpoint::open(&checkpoint_dir, STAGE_NAME)
            .await
            .with_context(|| format!("Failed to open checkpoint: {}", checkpoint_dir.display()))?;

        let state = FileDiscoveryCheckpoint::load(&checkpoint)
            .await
            .context("Failed to load discovery state")?;

        let schema_dir = paths::schema_dir(config);
        let bronze = Table::open(&schema_dir, paths::BRONZE_TABLE)
            .await
            .context("Failed to open bronze table")?;
        let dead_letters = Table::open(&schema_dir, paths::DEAD_LETTER_TABLE)
            .await
            .context("Failed to open dead-letter table")?;

        let filter = PathGlobFilter::for_extensions(&config.bronze.extensions)
            .context("Failed to build path filter")?;

        let prefix = paths::storage_prefix(config);

        tracing::info!(
            prefix = %prefix,
            filter = filter.as_str(),
            mode = ?config.bronze.mode,
            store = store.name(),
            known_files = state.len(),
            "Discovery stage ready"
        );

        Ok(Self {
            store,
            prefix,
            filter,
            settings: config.bronze.clone(),
            checkpoint,
            state,
            bronze,
            dead_letters,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn state(&self) -> &FileDiscoveryCheckpoint {
        &self.state
    }

    pub fn checkpoint(&self) -> &StreamCheckpoint {
        &self.checkpoint
    }

    /// Decide the input of the next batch and write its offset.
    ///
    /// Returns the pending batch left by an earlier run if there is one, so a
    /// restarted stage processes exactly what was planned. `None` when
    /// nothing is new.
    pub async fn plan_batch(&self) -> Result<Option<(OffsetEntry<DiscoveryOffset>, bool)>> {
        if let Some(pending) = self.checkpoint.pending_batch::<DiscoveryOffset>().await? {
            tracing::info!(
                batch_id = pending.batch_id,
                files = pending.offset.files.len(),
                "Resuming planned batch"
            );
            return Ok(Some((pending, true)));
        }

        let listing = self
            .settings
            .retry
            .run(&self.prefix, || self.store.list(&self.prefix, &self.filter))
            .await;
        let listed = listing
            .result
            .with_context(|| format!("Failed to list {}", self.prefix))?;

        let mut files: Vec<FileEntry> = listed
            .into_iter()
            .filter(|entry| self.state.is_new(entry))
            .collect();

        if files.is_empty() {
            tracing::debug!(prefix = %self.prefix, "No new files");
            return Ok(None);
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        let available = files.len();
        files.truncate(self.settings.max_files_per_trigger);

        let batch_id = self.checkpoint.next_batch_id().await?;
        let entry = self
            .checkpoint
            .write_offset(batch_id, DiscoveryOffset { files })
            .await
            .context("Failed to write offset")?;

        tracing::info!(
            batch_id,
            files = entry.offset.files.len(),
            deferred = available - entry.offset.files.len(),
            "Planned discovery batch"
        );

        Ok(Some((entry, false)))
    }

    /// Ingest every planned file concurrently.
    ///
    /// Unless this is the final attempt, any file failing with an exhausted
    /// transient error fails the batch; dropping the join set aborts the files
    /// still in flight.
    async fn execute_batch(
        &self,
        batch_id: u64,
        files: &[FileEntry],
        final_attempt: bool,
    ) -> Result<(Vec<BronzeFileRecord>, Vec<DeadLetterRecord>)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut tasks = JoinSet::new();

        for entry in files {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let entry = entry.clone();
            let mode = self.settings.mode;
            let retry = self.settings.retry.clone();

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| StorageError::Unavailable("ingest pool closed".to_string()))?;
                let ingest = Ingest {
                    mode,
                    retry: &retry,
                    batch_id,
                    final_attempt,
                };
                ingest.file(store.as_ref(), &entry).await
            });
        }

        let mut records = Vec::with_capacity(files.len());
        let mut dead_letters = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .context("Ingest task panicked")?
                .context("Transient storage errors exhausted retries")?;

            match outcome {
                FileOutcome::Ingested(record) => records.push(record),
                FileOutcome::DeadLetter(record) => dead_letters.push(record),
            }
        }

        records.sort_by(|a, b| a.path.cmp(&b.path));
        dead_letters.sort_by(|a, b| a.path.cmp(&b.path));

        Ok((records, dead_letters))
    }

    /// Make a planned batch durable and fold it into the discovery state
    async fn complete_batch(
        &mut self,
        entry: &OffsetEntry<DiscoveryOffset>,
        recovered: bool,
        attempt: u32,
    ) -> Result<BatchReport> {
        let batch_id = entry.batch_id;
        let writer = self.checkpoint.writer_id();

        let final_attempt = attempt >= self.settings.max_batch_attempts;
        if final_attempt && attempt > 1 {
            tracing::warn!(
                batch_id,
                attempt,
                "Final attempt for batch, files still failing will be dead-lettered"
            );
        }

        let (records, dead_letters) = match self.bronze.find_batch(&writer, batch_id).await? {
            Some(existing) => {
                // Appended before a crash; only the commit marker is missing
                tracing::info!(
                    batch_id,
                    version = existing.version,
                    "Batch already in bronze table, skipping to commit"
                );
                let dead_letters = self
                    .dead_letters
                    .find_batch(&writer, batch_id)
                    .await?
                    .map_or(0, |c| c.row_count);
                (existing.row_count, dead_letters)
            }
            None => {
                let (records, dead) = self
                    .execute_batch(batch_id, &entry.offset.files, final_attempt)
                    .await?;

                let dead_outcome = self
                    .dead_letters
                    .append_batch(&writer, batch_id, &dead)
                    .await
                    .context("Failed to append dead letters")?;
                for record in &dead {
                    tracing::warn!(
                        path = %record.path,
                        kind = ?record.error_kind,
                        error = %record.error,
                        "File dead-lettered"
                    );
                }

                let outcome = self
                    .bronze
                    .append_batch(&writer, batch_id, &records)
                    .await
                    .context("Failed to append bronze records")?;

                (outcome.row_count(), dead_outcome.row_count())
            }
        };

        let marker = CommitMarker {
            batch_id,
            committed_at: Utc::now(),
            records,
            dead_letters,
            dropped: 0,
        };
        self.checkpoint
            .commit(&marker)
            .await
            .context("Failed to write commit marker")?;

        self.state.apply(batch_id, &entry.offset);
        if (batch_id + 1) % self.settings.snapshot_interval == 0 {
            self.state
                .snapshot(&self.checkpoint)
                .await
                .context("Failed to snapshot discovery state")?;
        }

        Ok(BatchReport {
            stage: STAGE_NAME,
            batch_id,
            records,
            dead_letters,
            dropped: 0,
            recovered,
        })
    }
}

#[async_trait]
impl Stage for DiscoveryStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    async fn run_batch(&mut self) -> Result<Option<BatchReport>> {
        let Some((entry, recovered)) = self.plan_batch().await? else {
            return Ok(None);
        };

        let attempt = self
            .checkpoint
            .record_attempt(entry.batch_id)
            .await
            .context("Failed to record batch attempt")?;

        let report = self
            .complete_batch(&entry, recovered, attempt)
            .await
            .with_context(|| {
                format!("Discovery batch {} failed on attempt {}", entry.batch_id, attempt)
            })?;

        Ok(Some(report))
    }
}

/// How one batch ingests its files
struct Ingest<'a> {
    mode: IngestMode,
    retry: &'a RetryPolicy,
    batch_id: u64,

    /// Dead-letter exhausted transient failures instead of failing the batch
    final_attempt: bool,
}

impl Ingest<'_> {
    /// Stat or read one file, retrying transient errors.
    ///
    /// The record keeps the planned modification time so it matches what the
    /// discovery state marks as seen; a file rewritten since listing is picked
    /// up again under its new time.
    async fn file(
        &self,
        store: &dyn ObjectStore,
        entry: &FileEntry,
    ) -> Result<FileOutcome, StorageError> {
        let retry = self.retry;
        let (attempted, attempts) = match self.mode {
            IngestMode::MetadataOnly => {
                let outcome = retry.run(&entry.path, || store.stat(&entry.path)).await;
                (outcome.result.map(|stat| (stat.length, None)), outcome.attempts)
            }
            IngestMode::ContentInline => {
                let outcome = retry.run(&entry.path, || store.read(&entry.path)).await;
                (
                    outcome
                        .result
                        .map(|bytes| (bytes.len() as u64, Some(bytes))),
                    outcome.attempts,
                )
            }
        };

        let now = Utc::now();

        match attempted {
            Ok((length, content)) => {
                let mut planned = entry.clone();
                planned.length = length;
                Ok(FileOutcome::Ingested(BronzeFileRecord::from_entry(
                    &planned, content, now,
                )))
            }
            Err(e) if e.is_transient() && !self.final_attempt => Err(e),
            Err(e) => Ok(FileOutcome::DeadLetter(DeadLetterRecord {
                path: entry.path.clone(),
                modification_time: entry.modification_time,
                error_kind: e.dead_letter_kind(),
                error: e.describe(),
                attempts,
                batch_id: self.batch_id,
                recorded_at: now,
                ingested_date: now.date_naive(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store whose reads can be scripted to fail
    struct ScriptedStore {
        files: Vec<FileEntry>,
        failures: Mutex<HashMap<String, Vec<StorageError>>>,
    }

    #[async_trait]
    impl ObjectStore for ScriptedStore {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn list(
            &self,
            _prefix: &str,
            _filter: &PathGlobFilter,
        ) -> Result<Vec<FileEntry>, StorageError> {
            Ok(self.files.clone())
        }

        async fn stat(&self, path: &str) -> Result<FileEntry, StorageError> {
            if let Some(queue) = self.failures.lock().unwrap().get_mut(path) {
                if !queue.is_empty() {
                    return Err(queue.remove(0));
                }
            }
            self.files
                .iter()
                .find(|f| f.path == path)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(path.to_string()))
        }

        async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            let entry = self.stat(path).await?;
            Ok(vec![7; entry.length as usize])
        }
    }

    fn entry(path: &str, length: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            modification_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            length,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        }
    }

    async fn ingest(
        store: &ScriptedStore,
        file: FileEntry,
        mode: IngestMode,
        batch_id: u64,
        final_attempt: bool,
    ) -> Result<FileOutcome, StorageError> {
        let retry = fast_retry();
        let ingest = Ingest {
            mode,
            retry: &retry,
            batch_id,
            final_attempt,
        };
        ingest.file(store, &file).await
    }

    #[tokio::test]
    async fn test_ingest_file_metadata_only() {
        let store = ScriptedStore {
            files: vec![entry("/v/a.wav", 12)],
            failures: Mutex::new(HashMap::new()),
        };

        let outcome = ingest(&store, entry("/v/a.wav", 12), IngestMode::MetadataOnly, 0, false)
            .await
            .unwrap();

        match outcome {
            FileOutcome::Ingested(record) => {
                assert_eq!(record.file_size_bytes, 12);
                assert!(record.content.is_none());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingest_file_content_inline() {
        let store = ScriptedStore {
            files: vec![entry("/v/a.wav", 3)],
            failures: Mutex::new(HashMap::new()),
        };

        let outcome = ingest(&store, entry("/v/a.wav", 3), IngestMode::ContentInline, 0, false)
            .await
            .unwrap();

        match outcome {
            FileOutcome::Ingested(record) => assert_eq!(record.content, Some(vec![7, 7, 7])),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_becomes_dead_letter() {
        let store = ScriptedStore {
            files: vec![],
            failures: Mutex::new(HashMap::new()),
        };

        let outcome = ingest(&store, entry("/v/gone.wav", 3), IngestMode::MetadataOnly, 4, false)
            .await
            .unwrap();

        match outcome {
            FileOutcome::DeadLetter(record) => {
                assert_eq!(record.error_kind, crate::domain::DeadLetterKind::NotFound);
                assert_eq!(record.attempts, 1);
                assert_eq!(record.batch_id, 4);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_retries() {
        let mut failures = HashMap::new();
        failures.insert(
            "/v/a.wav".to_string(),
            vec![StorageError::Unavailable("throttled".to_string())],
        );
        let store = ScriptedStore {
            files: vec![entry("/v/a.wav", 5)],
            failures: Mutex::new(failures),
        };

        let outcome = ingest(&store, entry("/v/a.wav", 5), IngestMode::MetadataOnly, 0, false)
            .await
            .unwrap();
        assert!(matches!(outcome, FileOutcome::Ingested(_)));
    }

    #[tokio::test]
    async fn test_exhausted_transient_failure_is_an_error() {
        let mut failures = HashMap::new();
        failures.insert(
            "/v/a.wav".to_string(),
            vec![
                StorageError::Unavailable("down".to_string()),
                StorageError::Unavailable("still down".to_string()),
            ],
        );
        let store = ScriptedStore {
            files: vec![entry("/v/a.wav", 5)],
            failures: Mutex::new(failures),
        };

        let err = ingest(&store, entry("/v/a.wav", 5), IngestMode::MetadataOnly, 0, false)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_final_attempt_dead_letters_exhausted_transient_failure() {
        let mut failures = HashMap::new();
        failures.insert(
            "/v/a.wav".to_string(),
            vec![
                StorageError::Unavailable("down".to_string()),
                StorageError::Unavailable("still down".to_string()),
            ],
        );
        let store = ScriptedStore {
            files: vec![entry("/v/a.wav", 5)],
            failures: Mutex::new(failures),
        };

        let outcome = ingest(&store, entry("/v/a.wav", 5), IngestMode::MetadataOnly, 2, true)
            .await
            .unwrap();

        match outcome {
            FileOutcome::DeadLetter(record) => {
                assert_eq!(record.error_kind, crate::domain::DeadLetterKind::Other);
                assert_eq!(record.attempts, 2);
                assert_eq!(record.batch_id, 2);
                assert!(record.error.contains("still down"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
