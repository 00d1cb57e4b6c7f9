//! Enrichment stage: `bronze_audio_files` to `silver_audio_files`.
//!
//! Consumes bronze by table version. Each batch covers the versions in
//! `(start_after, end_version]`; rows without a supported extension or with
//! zero bytes are dropped, the rest get `transcription_status = pending`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{BatchReport, Stage};
use crate::checkpoint::{CommitMarker, OffsetEntry, StreamCheckpoint};
use crate::config::{paths, PipelineConfig};
use crate::domain::{BronzeFileRecord, SilverAudioRecord, TranscriptionStatus};
use crate::table::Table;

pub const STAGE_NAME: &str = "silver";

/// Range of bronze versions consumed by one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOffset {
    /// Last version consumed by the previous batch (exclusive bound)
    pub start_after: Option<u64>,

    /// Last version consumed by this batch (inclusive bound)
    pub end_version: u64,
}

pub struct EnrichmentStage {
    checkpoint: StreamCheckpoint,
    bronze: Table<BronzeFileRecord>,
    silver: Table<SilverAudioRecord>,
    extensions: Vec<String>,
    max_versions_per_trigger: Option<u64>,
}

impl EnrichmentStage {
    pub async fn open(config: &PipelineConfig) -> Result<Self> {
        let checkpoint_dir = paths::checkpoint_dir(config, paths::SILVER_TABLE);
        let checkpoint = StreamCheckpoint::open(&checkpoint_dir, STAGE_NAME)
            .await
            .with_context(|| format!("Failed to open checkpoint: {}", checkpoint_dir.display()))?;

        let schema_dir = paths::schema_dir(config);
        let bronze = Table::open(&schema_dir, paths::BRONZE_TABLE)
            .await
            .context("Failed to open bronze table")?;
        let silver = Table::open(&schema_dir, paths::SILVER_TABLE)
            .await
            .context("Failed to open silver table")?;

        Ok(Self {
            checkpoint,
            bronze,
            silver,
            extensions: config.bronze.extensions.clone(),
            max_versions_per_trigger: config.silver.max_versions_per_trigger,
        })
    }

    pub fn checkpoint(&self) -> &StreamCheckpoint {
        &self.checkpoint
    }

    /// Last bronze version covered by a committed batch
    async fn committed_through(&self) -> Result<Option<u64>> {
        let Some(batch_id) = self.checkpoint.latest_commit_id().await? else {
            return Ok(None);
        };

        let entry = self
            .checkpoint
            .read_offset::<TableOffset>(batch_id)
            .await?
            .with_context(|| format!("Committed batch {} has no offset", batch_id))?;

        Ok(Some(entry.offset.end_version))
    }

    /// Decide the bronze range of the next batch and write its offset
    pub async fn plan_batch(&self) -> Result<Option<(OffsetEntry<TableOffset>, bool)>> {
        if let Some(pending) = self.checkpoint.pending_batch::<TableOffset>().await? {
            tracing::info!(
                batch_id = pending.batch_id,
                start_after = ?pending.offset.start_after,
                end_version = pending.offset.end_version,
                "Resuming planned batch"
            );
            return Ok(Some((pending, true)));
        }

        let Some(latest) = self.bronze.latest_version().await? else {
            return Ok(None);
        };

        let start_after = self.committed_through().await?;
        if start_after.map_or(false, |done| done >= latest) {
            return Ok(None);
        }

        let first = start_after.map_or(0, |done| done + 1);
        let end_version = match self.max_versions_per_trigger {
            Some(max) => latest.min(first + max.max(1) - 1),
            None => latest,
        };

        let batch_id = self.checkpoint.next_batch_id().await?;
        let entry = self
            .checkpoint
            .write_offset(
                batch_id,
                TableOffset {
                    start_after,
                    end_version,
                },
            )
            .await
            .context("Failed to write offset")?;

        tracing::info!(
            batch_id,
            start_after = ?start_after,
            end_version,
            "Planned enrichment batch"
        );

        Ok(Some((entry, false)))
    }

    async fn complete_batch(
        &self,
        entry: &OffsetEntry<TableOffset>,
        recovered: bool,
    ) -> Result<BatchReport> {
        let batch_id = entry.batch_id;
        let writer = self.checkpoint.writer_id();

        let bronze_rows = self
            .bronze
            .read_range(entry.offset.start_after, entry.offset.end_version)
            .await
            .context("Failed to read bronze increment")?;

        let (records, dropped) = match self.silver.find_batch(&writer, batch_id).await? {
            Some(existing) => {
                tracing::info!(
                    batch_id,
                    version = existing.version,
                    "Batch already in silver table, skipping to commit"
                );
                (
                    existing.row_count,
                    bronze_rows.len().saturating_sub(existing.row_count),
                )
            }
            None => {
                let enriched = enrich_batch(&bronze_rows, &self.extensions);
                let dropped = bronze_rows.len() - enriched.len();

                let outcome = self
                    .silver
                    .append_batch(&writer, batch_id, &enriched)
                    .await
                    .context("Failed to append silver records")?;

                (outcome.row_count(), dropped)
            }
        };

        self.checkpoint
            .commit(&CommitMarker {
                batch_id,
                committed_at: Utc::now(),
                records,
                dead_letters: 0,
                dropped,
            })
            .await
            .context("Failed to write commit marker")?;

        Ok(BatchReport {
            stage: STAGE_NAME,
            batch_id,
            records,
            dead_letters: 0,
            dropped,
            recovered,
        })
    }
}

#[async_trait]
impl Stage for EnrichmentStage {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    async fn run_batch(&mut self) -> Result<Option<BatchReport>> {
        let Some((entry, recovered)) = self.plan_batch().await? else {
            return Ok(None);
        };

        let report = self
            .complete_batch(&entry, recovered)
            .await
            .with_context(|| format!("Enrichment batch {} failed", entry.batch_id))?;

        Ok(Some(report))
    }
}

/// Validate and enrich bronze rows; one `processed_at` for the whole batch
pub fn enrich_batch(rows: &[BronzeFileRecord], extensions: &[String]) -> Vec<SilverAudioRecord> {
    let processed_at = Utc::now();
    rows.iter()
        .filter_map(|row| SilverAudioRecord::enrich(row, extensions, processed_at))
        .collect()
}

/// Silver records still waiting for transcription, oldest ingestion first
pub async fn pending_records(
    config: &PipelineConfig,
    limit: Option<usize>,
) -> Result<Vec<SilverAudioRecord>> {
    let silver: Table<SilverAudioRecord> =
        Table::open(&paths::schema_dir(config), paths::SILVER_TABLE)
            .await
            .context("Failed to open silver table")?;

    let mut pending: Vec<SilverAudioRecord> = silver
        .scan()
        .await
        .context("Failed to read silver table")?
        .into_iter()
        .filter(|record| record.transcription_status == TranscriptionStatus::Pending)
        .collect();

    pending.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then_with(|| a.path.cmp(&b.path)));
    if let Some(limit) = limit {
        pending.truncate(limit);
    }

    Ok(pending)
}
