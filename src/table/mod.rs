//! Append-only, partitioned record tables.
//!
//! Layout of a table directory:
//!
//! ```text
//! bronze_audio_files/
//! ├── _log/00000000000000000000.json      commit entries, one per version
//! └── data/ingested_date=2026-10-17/
//!     └── part-00000000000000000000-<commit>.jsonl
//! ```
//!
//! Rows are JSON Lines, grouped into one data file per partition per commit.
//! Appends are tagged with `(writer, batch_id)`; appending a batch that the
//! same writer already committed is a no-op, which is what makes stage
//! re-runs after a crash safe.

pub mod log;

use std::collections::BTreeMap;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::durable;

pub use log::{CommitEntry, DataFile};

/// Errors from table reads and appends
#[derive(Debug, Error)]
pub enum TableError {
    #[error("IO error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error in {path}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Version {version} of table '{table}' was committed by another writer")]
    VersionConflict { table: String, version: u64 },
}

impl TableError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Rows that know their partition columns
pub trait Partitioned {
    /// Ordered `(column, value)` pairs; the order defines the directory nesting
    fn partition_values(&self) -> Vec<(&'static str, String)>;
}

/// Result of an append
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// New version written
    Committed(CommitEntry),

    /// The writer had already committed this batch
    AlreadyCommitted(CommitEntry),

    /// Nothing to write
    Empty,
}

impl AppendOutcome {
    /// Check if this append created a new version
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Rows covered by the batch (whether written now or earlier)
    pub fn row_count(&self) -> usize {
        match self {
            Self::Committed(entry) | Self::AlreadyCommitted(entry) => entry.row_count,
            Self::Empty => 0,
        }
    }
}

/// An append-only table of `T` rows
#[derive(Debug)]
pub struct Table<T> {
    name: String,
    root: PathBuf,
    log_dir: PathBuf,
    _rows: PhantomData<fn() -> T>,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned + Partitioned,
{
    /// Create or open the table `name` under `parent`
    pub async fn open(parent: &Path, name: &str) -> Result<Self, TableError> {
        let root = parent.join(name);
        let log_dir = root.join("_log");

        fs::create_dir_all(&log_dir)
            .await
            .map_err(|e| TableError::io(&log_dir, e))?;

        Ok(Self {
            name: name.to_string(),
            root,
            log_dir,
            _rows: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Highest committed version, if any
    pub async fn latest_version(&self) -> Result<Option<u64>, TableError> {
        Ok(log::list_versions(&self.log_dir).await?.last().copied())
    }

    /// All commit entries in version order
    pub async fn commits(&self) -> Result<Vec<CommitEntry>, TableError> {
        let mut entries = Vec::new();
        for version in log::list_versions(&self.log_dir).await? {
            entries.push(log::read_entry(&self.log_dir, version).await?);
        }
        Ok(entries)
    }

    /// Find the commit a writer made for a batch.
    ///
    /// A writer's batch ids only grow, so the newest-first scan stops at the
    /// first commit of that writer for an earlier batch.
    pub async fn find_batch(
        &self,
        writer: &str,
        batch_id: u64,
    ) -> Result<Option<CommitEntry>, TableError> {
        for version in log::list_versions(&self.log_dir).await?.into_iter().rev() {
            let entry = log::read_entry(&self.log_dir, version).await?;
            if entry.writer != writer {
                continue;
            }
            if entry.batch_id == batch_id {
                return Ok(Some(entry));
            }
            if entry.batch_id < batch_id {
                break;
            }
        }
        Ok(None)
    }

    /// Append `rows` as one commit tagged `(writer, batch_id)`
    pub async fn append_batch(
        &self,
        writer: &str,
        batch_id: u64,
        rows: &[T],
    ) -> Result<AppendOutcome, TableError> {
        if rows.is_empty() {
            return Ok(AppendOutcome::Empty);
        }

        if let Some(existing) = self.find_batch(writer, batch_id).await? {
            tracing::debug!(
                table = %self.name,
                batch_id,
                version = existing.version,
                "Batch already committed, skipping append"
            );
            return Ok(AppendOutcome::AlreadyCommitted(existing));
        }

        let version = self.latest_version().await?.map(|v| v + 1).unwrap_or(0);
        let commit_id = Uuid::new_v4();

        // Group rows by partition, keeping input order within each group
        let mut partitions: BTreeMap<Vec<(&'static str, String)>, Vec<&T>> = BTreeMap::new();
        for row in rows {
            partitions.entry(row.partition_values()).or_default().push(row);
        }

        let mut files = Vec::with_capacity(partitions.len());
        for (values, group) in partitions {
            files.push(self.write_data_file(version, commit_id, values, &group).await?);
        }

        let entry = CommitEntry {
            version,
            commit_id,
            writer: writer.to_string(),
            batch_id,
            committed_at: Utc::now(),
            row_count: rows.len(),
            files,
        };

        if !log::publish_entry(&self.log_dir, &entry).await? {
            return Err(TableError::VersionConflict {
                table: self.name.clone(),
                version,
            });
        }

        tracing::debug!(
            table = %self.name,
            version,
            batch_id,
            rows = entry.row_count,
            "Committed table version"
        );

        Ok(AppendOutcome::Committed(entry))
    }

    /// Rows of versions in `(after, up_to]`, in commit order
    pub async fn read_range(&self, after: Option<u64>, up_to: u64) -> Result<Vec<T>, TableError> {
        let mut rows = Vec::new();

        for version in log::list_versions(&self.log_dir).await? {
            if after.map_or(false, |a| version <= a) || version > up_to {
                continue;
            }
            let entry = log::read_entry(&self.log_dir, version).await?;
            for file in &entry.files {
                self.read_data_file(file, &mut rows).await?;
            }
        }

        Ok(rows)
    }

    /// Every row in the table
    pub async fn scan(&self) -> Result<Vec<T>, TableError> {
        match self.latest_version().await? {
            Some(latest) => self.read_range(None, latest).await,
            None => Ok(Vec::new()),
        }
    }

    /// Total committed rows (from the log, without reading data files)
    pub async fn row_count(&self) -> Result<usize, TableError> {
        Ok(self.commits().await?.iter().map(|c| c.row_count).sum())
    }

    async fn write_data_file(
        &self,
        version: u64,
        commit_id: Uuid,
        values: Vec<(&'static str, String)>,
        rows: &[&T],
    ) -> Result<DataFile, TableError> {
        let mut rel_path = String::from("data");
        for (column, value) in &values {
            rel_path.push('/');
            rel_path.push_str(&format!("{}={}", column, escape_partition_value(value)));
        }

        let dir = self.root.join(&rel_path);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| TableError::io(&dir, e))?;

        let file_name = format!("part-{:020}-{}.jsonl", version, commit_id.simple());
        let path = dir.join(&file_name);

        let mut content = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut content, row).map_err(|source| {
                TableError::Serialization {
                    path: path.clone(),
                    source,
                }
            })?;
            content.push(b'\n');
        }

        durable::write_atomic(&path, &content)
            .await
            .map_err(|e| TableError::io(&path, e))?;

        Ok(DataFile {
            path: format!("{}/{}", rel_path, file_name),
            partition: values
                .into_iter()
                .map(|(column, value)| (column.to_string(), value))
                .collect(),
            rows: rows.len(),
        })
    }

    async fn read_data_file(&self, file: &DataFile, rows: &mut Vec<T>) -> Result<(), TableError> {
        let path = self.root.join(&file.path);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| TableError::io(&path, e))?;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(line).map_err(|source| TableError::Serialization {
                path: path.clone(),
                source,
            })?;
            rows.push(row);
        }

        Ok(())
    }
}

fn escape_partition_value(value: &str) -> String {
    if value.is_empty() {
        return "__empty__".to_string();
    }
    value.replace('%', "%25").replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        day: String,
        name: String,
    }

    impl Partitioned for Row {
        fn partition_values(&self) -> Vec<(&'static str, String)> {
            vec![("day", self.day.clone())]
        }
    }

    fn row(day: &str, name: &str) -> Row {
        Row {
            day: day.to_string(),
            name: name.to_string(),
        }
    }

    async fn create_test_table() -> (Table<Row>, TempDir) {
        let temp = TempDir::new().unwrap();
        let table = Table::open(temp.path(), "rows").await.unwrap();
        (table, temp)
    }

    #[tokio::test]
    async fn test_append_and_scan() {
        let (table, _temp) = create_test_table().await;

        let outcome = table
            .append_batch("w", 0, &[row("2026-10-16", "a"), row("2026-10-17", "b")])
            .await
            .unwrap();
        assert!(outcome.is_new());
        assert_eq!(outcome.row_count(), 2);

        table.append_batch("w", 1, &[row("2026-10-17", "c")]).await.unwrap();

        let rows = table.scan().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(table.latest_version().await.unwrap(), Some(1));
        assert_eq!(table.row_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_partitions_become_directories() {
        let (table, _temp) = create_test_table().await;

        let outcome = table
            .append_batch("w", 0, &[row("2026-10-16", "a"), row("2026-10-17", "b")])
            .await
            .unwrap();

        let entry = match outcome {
            AppendOutcome::Committed(entry) => entry,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(entry.files.len(), 2);
        assert!(entry.files[0].path.starts_with("data/day=2026-10-16/part-"));
        assert!(table.root().join(&entry.files[1].path).exists());
    }

    #[tokio::test]
    async fn test_same_batch_is_not_appended_twice() {
        let (table, _temp) = create_test_table().await;

        table.append_batch("w", 3, &[row("d", "a")]).await.unwrap();
        let again = table.append_batch("w", 3, &[row("d", "a")]).await.unwrap();

        assert!(matches!(again, AppendOutcome::AlreadyCommitted(_)));
        assert_eq!(table.scan().await.unwrap().len(), 1);

        // A different writer with the same batch number is independent
        let other = table.append_batch("other", 3, &[row("d", "b")]).await.unwrap();
        assert!(other.is_new());
    }

    #[tokio::test]
    async fn test_find_batch_stops_at_earlier_batch_of_writer() {
        let (table, _temp) = create_test_table().await;

        table.append_batch("w", 0, &[row("d", "a")]).await.unwrap();
        table.append_batch("other", 9, &[row("d", "b")]).await.unwrap();
        table.append_batch("w", 1, &[row("d", "c")]).await.unwrap();

        // Version 0 is unreadable; a lookup for batch 2 must not need it
        let first_entry = table.root().join("_log").join(log::log_file_name(0));
        tokio::fs::write(&first_entry, b"not json").await.unwrap();

        assert!(table.find_batch("w", 2).await.unwrap().is_none());
        assert_eq!(table.find_batch("w", 1).await.unwrap().unwrap().version, 2);
        assert_eq!(table.find_batch("other", 9).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_empty_append_writes_nothing() {
        let (table, _temp) = create_test_table().await;

        let outcome = table.append_batch("w", 0, &[]).await.unwrap();
        assert!(matches!(outcome, AppendOutcome::Empty));
        assert_eq!(table.latest_version().await.unwrap(), None);
        assert!(table.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_range_is_exclusive_inclusive() {
        let (table, _temp) = create_test_table().await;

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            table.append_batch("w", i as u64, &[row("d", name)]).await.unwrap();
        }

        let middle = table.read_range(Some(0), 1).await.unwrap();
        assert_eq!(middle, vec![row("d", "b")]);

        let from_start = table.read_range(None, 1).await.unwrap();
        assert_eq!(from_start.len(), 2);
    }

    #[tokio::test]
    async fn test_orphan_data_files_are_ignored() {
        let (table, _temp) = create_test_table().await;
        table.append_batch("w", 0, &[row("d", "a")]).await.unwrap();

        // Simulate an append that crashed after writing data but before the log entry
        let orphan_dir = table.root().join("data/day=d");
        tokio::fs::write(
            orphan_dir.join("part-00000000000000000001-dead.jsonl"),
            b"{\"day\":\"d\",\"name\":\"ghost\"}\n",
        )
        .await
        .unwrap();

        let rows = table.scan().await.unwrap();
        assert_eq!(rows, vec![row("d", "a")]);
    }

    #[test]
    fn test_escape_partition_value() {
        assert_eq!(escape_partition_value("wav"), "wav");
        assert_eq!(escape_partition_value("a/b"), "a%2Fb");
        assert_eq!(escape_partition_value(""), "__empty__");
    }
}
