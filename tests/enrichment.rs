//! Enrichment Integration Tests
//!
//! Silver stage behavior over bronze table versions: filtering, derived
//! columns, initial status and incremental consumption.

use std::path::PathBuf;
use std::sync::Arc;

use audio_etl::config::{paths, PipelineConfig};
use audio_etl::domain::{BronzeFileRecord, SilverAudioRecord, TranscriptionStatus};
use audio_etl::stages::{silver, DiscoveryStage, EnrichmentStage, Stage};
use audio_etl::storage::LocalVolume;
use audio_etl::table::Table;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    config: PipelineConfig,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().display().to_string();
        let yaml = format!(
            "catalog: main\n\
             schema: audio\n\
             schema_location_base: {root}/checkpoints\n\
             volumes_root: {root}/volumes\n\
             tables_root: {root}/tables\n"
        );
        let config = PipelineConfig::from_yaml(&yaml).unwrap();

        Self {
            _temp: temp,
            config,
        }
    }

    async fn bronze(&self) -> Table<BronzeFileRecord> {
        Table::open(&paths::schema_dir(&self.config), paths::BRONZE_TABLE)
            .await
            .unwrap()
    }

    async fn silver_rows(&self) -> Vec<SilverAudioRecord> {
        let table: Table<SilverAudioRecord> =
            Table::open(&paths::schema_dir(&self.config), paths::SILVER_TABLE)
                .await
                .unwrap();
        table.scan().await.unwrap()
    }

    /// Append bronze rows as an upstream writer would
    async fn append_bronze(&self, batch_id: u64, rows: &[(&str, u64)]) {
        let records: Vec<BronzeFileRecord> = rows.iter().map(|(p, s)| bronze(p, *s)).collect();
        self.bronze()
            .await
            .append_batch("upstream", batch_id, &records)
            .await
            .unwrap();
    }
}

fn bronze(path: &str, size: u64) -> BronzeFileRecord {
    let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    BronzeFileRecord {
        path: path.to_string(),
        content: None,
        modification_time: at,
        file_size_bytes: size,
        ingested_at: at,
        ingested_date: at.date_naive(),
    }
}

#[tokio::test]
async fn test_extension_filter() {
    let fx = Fixture::new();
    fx.append_bronze(
        0,
        &[("/v/a.WAV", 10), ("/v/b.wav", 10), ("/v/c.txt", 10), ("/v/d", 10), ("/v/e.", 10)],
    )
    .await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    let report = stage.run_batch().await.unwrap().unwrap();
    assert_eq!(report.records, 2);
    assert_eq!(report.dropped, 3);

    let rows = fx.silver_rows().await;
    let kept: Vec<(&str, &str)> = rows
        .iter()
        .map(|r| (r.file_name.as_str(), r.file_extension.as_str()))
        .collect();
    assert_eq!(kept, vec![("a.WAV", "wav"), ("b.wav", "wav")]);
}

#[tokio::test]
async fn test_size_filter() {
    let fx = Fixture::new();
    fx.append_bronze(0, &[("/v/empty.wav", 0), ("/v/one.wav", 1)]).await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    stage.run_batch().await.unwrap();

    let rows = fx.silver_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].file_name, "one.wav");
    assert_eq!(rows[0].file_size_bytes, 1);
}

#[tokio::test]
async fn test_multi_dot_name_and_initial_status() {
    let fx = Fixture::new();
    fx.append_bronze(0, &[("/v/2026/clip.final.mp3", 42)]).await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    stage.run_batch().await.unwrap();

    let rows = fx.silver_rows().await;
    assert_eq!(rows[0].path, "/v/2026/clip.final.mp3");
    assert_eq!(rows[0].file_name, "clip.final.mp3");
    assert_eq!(rows[0].file_extension, "mp3");
    assert_eq!(rows[0].transcription_status, TranscriptionStatus::Pending);
    assert_eq!(rows[0].ingested_at, bronze("x", 1).ingested_at);
}

#[tokio::test]
async fn test_consumes_only_new_versions() {
    let fx = Fixture::new();
    fx.append_bronze(0, &[("/v/a.wav", 1)]).await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    stage.run_batch().await.unwrap();
    assert!(stage.run_batch().await.unwrap().is_none());

    fx.append_bronze(1, &[("/v/b.wav", 1)]).await;
    let report = stage.run_batch().await.unwrap().unwrap();
    assert_eq!(report.batch_id, 1);
    assert_eq!(report.records, 1);

    let paths: Vec<String> = fx.silver_rows().await.into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/v/a.wav", "/v/b.wav"]);
}

#[tokio::test]
async fn test_batch_with_nothing_kept_still_commits() {
    let fx = Fixture::new();
    fx.append_bronze(0, &[("/v/c.txt", 5)]).await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    let report = stage.run_batch().await.unwrap().unwrap();
    assert_eq!(report.records, 0);
    assert_eq!(report.dropped, 1);
    assert!(stage.run_batch().await.unwrap().is_none());
}

#[tokio::test]
async fn test_versions_per_trigger_cap() {
    let mut fx = Fixture::new();
    fx.config.silver.max_versions_per_trigger = Some(2);
    for batch_id in 0..5 {
        fx.append_bronze(batch_id, &[(&format!("/v/{}.wav", batch_id), 1)]).await;
    }

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    let mut records = Vec::new();
    while let Some(report) = stage.run_batch().await.unwrap() {
        records.push(report.records);
    }

    assert_eq!(records, vec![2, 2, 1]);
}

#[tokio::test]
async fn test_pending_view() {
    let fx = Fixture::new();
    fx.append_bronze(0, &[("/v/b.wav", 1), ("/v/a.wav", 1), ("/v/c.ogg", 1)]).await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    stage.run_batch().await.unwrap();

    let all = silver::pending_records(&fx.config, None).await.unwrap();
    assert_eq!(all.len(), 3);

    let limited = silver::pending_records(&fx.config, Some(2)).await.unwrap();
    let paths: Vec<&str> = limited.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["/v/a.wav", "/v/b.wav"]);
}

#[tokio::test]
async fn test_pending_view_tolerates_states_written_downstream() {
    let fx = Fixture::new();
    fx.append_bronze(0, &[("/v/a.wav", 1), ("/v/b.wav", 1)]).await;

    let mut stage = EnrichmentStage::open(&fx.config).await.unwrap();
    stage.run_batch().await.unwrap();

    // The transcription job records a state of its own for one path
    let source = bronze("/v/b.wav", 1);
    let mut reviewed =
        SilverAudioRecord::enrich(&source, &["wav".to_string()], Utc::now()).unwrap();
    reviewed.transcription_status = TranscriptionStatus::External("needs_review".to_string());
    let silver: Table<SilverAudioRecord> =
        Table::open(&paths::schema_dir(&fx.config), paths::SILVER_TABLE)
            .await
            .unwrap();
    silver.append_batch("transcriber", 0, &[reviewed]).await.unwrap();

    let rows = fx.silver_rows().await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].transcription_status.as_str(), "needs_review");

    let pending = silver::pending_records(&fx.config, None).await.unwrap();
    assert_eq!(pending.len(), 2);
}

#[tokio::test]
async fn test_files_flow_from_volume_to_silver() {
    let fx = Fixture::new();
    let files_dir = PathBuf::from(paths::storage_prefix(&fx.config));
    std::fs::create_dir_all(&files_dir).unwrap();
    std::fs::write(files_dir.join("talk.m4a"), b"ftyp").unwrap();
    std::fs::write(files_dir.join("silence.wav"), b"").unwrap();

    let mut bronze = DiscoveryStage::open(&fx.config, Arc::new(LocalVolume::new()))
        .await
        .unwrap();
    let report = bronze.run_batch().await.unwrap().unwrap();
    assert_eq!(report.records, 2);

    let mut silver_stage = EnrichmentStage::open(&fx.config).await.unwrap();
    let report = silver_stage.run_batch().await.unwrap().unwrap();
    assert_eq!(report.records, 1);
    assert_eq!(report.dropped, 1);

    let pending = silver::pending_records(&fx.config, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].file_name, "talk.m4a");
    assert_eq!(pending[0].file_extension, "m4a");
}
