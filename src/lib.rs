//! audio-etl - Incremental, checkpointed audio file ingestion
//!
//! Two stages turn files dropped into a storage volume into tables a
//! transcription job can consume:
//!
//! - **bronze** discovers new or modified files and records each
//!   `(path, modification_time)` exactly once
//! - **silver** validates and enriches bronze rows, initializing
//!   `transcription_status` to `pending`
//!
//! # Architecture
//!
//! Each stage keeps a write-ahead checkpoint (planned offsets, then commit
//! markers) and appends to versioned tables tagged with its checkpoint id, so
//! a batch interrupted at any point is re-run without duplicating rows.
//!
//! # Modules
//!
//! - `config`: Pipeline configuration and derived paths
//! - `domain`: Records, transcription status, supported formats
//! - `storage`: Object store boundary and the local volume backend
//! - `table`: Append-only partitioned tables
//! - `checkpoint`: Stage checkpoints and discovery state
//! - `stages`: Bronze and silver stages, trigger loop
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Ingest everything currently available, then exit
//! audio-etl run
//!
//! # Keep both stages running
//! audio-etl run --continuous
//!
//! # What is waiting for transcription?
//! audio-etl pending --limit 20
//! ```

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod domain;
pub mod durable;
pub mod stages;
pub mod storage;
pub mod table;

// Re-export main types at crate root for convenience
pub use config::{IngestMode, PipelineConfig, ResolvedConfig};
pub use domain::{BronzeFileRecord, DeadLetterRecord, SilverAudioRecord, TranscriptionStatus};
pub use stages::{DiscoveryStage, EnrichmentStage, Stage, Trigger};
pub use storage::{FileEntry, LocalVolume, ObjectStore};
