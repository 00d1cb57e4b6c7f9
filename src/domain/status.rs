//! Transcription lifecycle status.
//!
//! This crate only ever writes `Pending`. The remaining states belong to the
//! external transcription job, which advances them by `path`. A state this
//! crate does not know is kept verbatim as [`TranscriptionStatus::External`]
//! so reading the silver table never fails on it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a silver record through downstream transcription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TranscriptionStatus {
    /// Waiting for the transcription job
    Pending,

    /// Picked up by the transcription job
    InProgress,

    /// Transcript produced
    Transcribed,

    /// Transcription failed
    Failed,

    /// A state written by the transcription job that this crate does not model
    External(String),
}

impl Default for TranscriptionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TranscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Transcribed => "transcribed",
            Self::Failed => "failed",
            Self::External(state) => state,
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transcribed | Self::Failed)
    }

    /// Whether moving to `next` keeps the lifecycle monotonic.
    ///
    /// Transitions into or out of an external state are never checked here.
    pub fn can_transition_to(&self, next: &TranscriptionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::InProgress | Self::Transcribed | Self::Failed) => true,
            (Self::InProgress, Self::Transcribed | Self::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TranscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TranscriptionStatus {
    fn from(state: String) -> Self {
        match state.parse() {
            Ok(known) => known,
            Err(_) => Self::External(state),
        }
    }
}

impl From<TranscriptionStatus> for String {
    fn from(status: TranscriptionStatus) -> Self {
        match status {
            TranscriptionStatus::External(state) => state,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for TranscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "transcribed" => Ok(Self::Transcribed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown transcription status: {}", other)),
        }
    }
}
