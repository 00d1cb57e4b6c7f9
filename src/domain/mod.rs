//! Domain types for the audio ingestion pipeline.
//!
//! This module contains the core data structures:
//! - Records: bronze, silver, and dead-letter rows
//! - Status: the transcription lifecycle
//! - Formats: supported extensions and path derivation

pub mod formats;
pub mod records;
pub mod status;

// Re-export commonly used types
pub use formats::{file_extension, file_name, SUPPORTED_EXTENSIONS};
pub use records::{BronzeFileRecord, DeadLetterKind, DeadLetterRecord, SilverAudioRecord};
pub use status::TranscriptionStatus;
