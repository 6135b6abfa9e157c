//! Persisted entities: uploaded artifacts, their raw lines and decoded records.

use crate::codec::{DecodedLine, FieldValue, RecordType};
use crate::phase::{Phase, PhaseTransition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifies one uploaded file and its storage partition.
    ArtifactId,
    "artifact-"
);
id_type!(
    /// Identifies one raw line.
    LineId,
    "line-"
);
id_type!(
    /// Identifies one decoded record.
    RecordId,
    "record-"
);

/// An uploaded TDDF file and its lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct UploadArtifact {
    pub id: ArtifactId,
    pub filename: String,
    pub size_bytes: u64,
    pub environment: String,
    /// md5 of the uploaded bytes
    pub content_hash: String,
    pub phase: Phase,
    /// Phase to return to when a hold is released.
    pub held_from: Option<Phase>,
    pub retry_count: u32,
    /// Owner of the artifact lease while it is being processed.
    pub lock_owner: Option<String>,
    pub line_count: usize,
    /// Raw-line count per record identifier, filled in at identification.
    pub tag_counts: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_detail: Option<String>,
    pub history: Vec<PhaseTransition>,
}

/// Raw-line processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Pending,
    Processing,
    Processed,
    Skipped,
    Failed,
}

impl LineStatus {
    /// Lines in these states are not yet settled.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, LineStatus::Pending | LineStatus::Processing)
    }
}

/// One line of an artifact before decoding.
#[derive(Debug, Clone, Serialize)]
pub struct RawLine {
    pub id: LineId,
    pub artifact_id: ArtifactId,
    /// 1-based
    pub line_number: u32,
    pub text: String,
    /// Detected record identifier; empty when none was found.
    pub tag: String,
    pub status: LineStatus,
    pub skip_reason: Option<String>,
    pub record_id: Option<RecordId>,
    /// Set when the line was taken for processing.
    pub processing_since: Option<DateTime<Utc>>,
}

/// A successfully decoded raw line. Immutable once stored.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedRecord {
    pub id: RecordId,
    pub artifact_id: ArtifactId,
    pub raw_line_id: LineId,
    pub line_number: u32,
    pub record_type: RecordType,
    pub tag: Option<String>,
    pub fields: BTreeMap<&'static str, FieldValue>,
    pub field_count: usize,
    pub created_at: DateTime<Utc>,
}

impl DecodedRecord {
    pub fn from_decoded(
        id: RecordId,
        artifact_id: ArtifactId,
        raw_line_id: LineId,
        decoded: DecodedLine,
        created_at: DateTime<Utc>,
    ) -> Self {
        DecodedRecord {
            id,
            artifact_id,
            raw_line_id,
            line_number: decoded.line_number,
            record_type: decoded.record_type,
            tag: decoded.tag,
            fields: decoded.fields,
            field_count: decoded.field_count,
            created_at,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Non-null text value of a field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FieldValue::as_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(ArtifactId(7).to_string(), "artifact-7");
        assert_eq!(RecordId(3).to_string(), "record-3");
    }

    #[test]
    fn test_outstanding_statuses() {
        assert!(LineStatus::Pending.is_outstanding());
        assert!(LineStatus::Processing.is_outstanding());
        assert!(!LineStatus::Processed.is_outstanding());
        assert!(!LineStatus::Skipped.is_outstanding());
    }
}
