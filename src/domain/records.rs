//! Rows written by the bronze and silver stages.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::formats;
use super::status::TranscriptionStatus;
use crate::storage::FileEntry;
use crate::table::Partitioned;

/// One row per ingested `(path, modification_time)`.
///
/// `content` is only populated in content-inline mode and is hex-encoded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BronzeFileRecord {
    /// Storage location of the file
    pub path: String,

    /// Raw bytes (content-inline mode only)
    #[serde(default, skip_serializing_if = "Option::is_none", with = "content_hex")]
    pub content: Option<Vec<u8>>,

    /// Modification time reported by storage
    pub modification_time: DateTime<Utc>,

    /// File length in bytes
    pub file_size_bytes: u64,

    /// When the file was ingested
    pub ingested_at: DateTime<Utc>,

    /// Date part of `ingested_at`
    pub ingested_date: NaiveDate,
}

impl BronzeFileRecord {
    pub fn from_entry(
        entry: &FileEntry,
        content: Option<Vec<u8>>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            path: entry.path.clone(),
            content,
            modification_time: entry.modification_time,
            file_size_bytes: entry.length,
            ingested_at,
            ingested_date: ingested_at.date_naive(),
        }
    }
}

impl Partitioned for BronzeFileRecord {
    fn partition_values(&self) -> Vec<(&'static str, String)> {
        vec![("ingested_date", self.ingested_date.to_string())]
    }
}

/// Validated, status-initialized projection of a bronze record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SilverAudioRecord {
    pub path: String,
    pub file_name: String,
    pub file_extension: String,
    pub file_size_bytes: u64,
    pub modification_time: DateTime<Utc>,
    pub transcription_status: TranscriptionStatus,
    pub ingested_at: DateTime<Utc>,
    pub ingested_date: NaiveDate,
    pub processed_at: DateTime<Utc>,
}

impl SilverAudioRecord {
    /// Derive a silver record, or `None` when the bronze row is not a
    /// non-empty file with a supported extension.
    pub fn enrich(
        bronze: &BronzeFileRecord,
        extensions: &[String],
        processed_at: DateTime<Utc>,
    ) -> Option<Self> {
        let file_extension = formats::file_extension(&bronze.path);

        if !formats::is_supported(&file_extension, extensions) || bronze.file_size_bytes == 0 {
            return None;
        }

        Some(Self {
            path: bronze.path.clone(),
            file_name: formats::file_name(&bronze.path).to_string(),
            file_extension,
            file_size_bytes: bronze.file_size_bytes,
            modification_time: bronze.modification_time,
            transcription_status: TranscriptionStatus::Pending,
            ingested_at: bronze.ingested_at,
            ingested_date: bronze.ingested_date,
            processed_at,
        })
    }
}

impl Partitioned for SilverAudioRecord {
    fn partition_values(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ingested_date", self.ingested_date.to_string()),
            ("file_extension", self.file_extension.clone()),
        ]
    }
}

/// Why a file ended up in the dead-letter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    NotFound,
    PermissionDenied,
    InvalidData,
    Other,
}

/// A file discovery could not ingest. Still counts as discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub path: String,
    pub modification_time: DateTime<Utc>,
    pub error_kind: DeadLetterKind,
    pub error: String,
    pub attempts: u32,
    pub batch_id: u64,
    pub recorded_at: DateTime<Utc>,
    pub ingested_date: NaiveDate,
}

impl Partitioned for DeadLetterRecord {
    fn partition_values(&self) -> Vec<(&'static str, String)> {
        vec![("ingested_date", self.ingested_date.to_string())]
    }
}

mod content_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
