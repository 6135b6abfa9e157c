//! Fixed-width TDDF line codec.
//!
//! `decode` is pure CPU work: it classifies the line by its 2-character
//! record identifier and walks the matching field table. Sub-field problems
//! become null values; an unknown tag becomes an `Other` record carrying the
//! raw text. Only a blank line is refused.

pub mod field;
pub mod layout;

pub use field::{FieldSpec, FieldValue, Transform};
pub use layout::{RecordType, RECOGNIZED_TAGS, TAG_OFFSET, TAG_SCAN_WINDOW};

use crate::error::DecodeError;
use serde::Serialize;
use std::collections::BTreeMap;

/// Where on the line the record identifier was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedTag {
    pub tag: String,
    pub offset: usize,
}

impl DetectedTag {
    pub fn drifted(&self) -> bool {
        self.offset != TAG_OFFSET
    }
}

/// Output of [`decode`] for one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedLine {
    pub line_number: u32,
    pub record_type: RecordType,
    /// Recognised identifier, `None` when no tag could be found at all.
    pub tag: Option<String>,
    pub fields: BTreeMap<&'static str, FieldValue>,
    /// Number of non-null extracted fields.
    pub field_count: usize,
}

impl DecodedLine {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Finds the record identifier.
///
/// Reads [`TAG_OFFSET`] first. When that is not a recognised tag, scans the
/// first [`TAG_SCAN_WINDOW`] characters, nearest positions first, to tolerate
/// upstream files whose columns have shifted.
pub fn detect_tag(line: &str) -> Option<DetectedTag> {
    let at = |offset: usize| -> Option<DetectedTag> {
        let candidate = line.get(offset..offset + 2)?;
        layout::is_recognized(candidate).then(|| DetectedTag {
            tag: candidate.to_string(),
            offset,
        })
    };

    if let Some(found) = at(TAG_OFFSET) {
        return Some(found);
    }

    let window = line.len().min(TAG_SCAN_WINDOW);
    if window < 2 {
        return None;
    }
    let mut offsets: Vec<usize> = (0..=window - 2).filter(|&o| o != TAG_OFFSET).collect();
    offsets.sort_by_key(|&o| (o as isize - TAG_OFFSET as isize).unsigned_abs());
    offsets.into_iter().find_map(at)
}

/// Decodes one raw line.
pub fn decode(raw: &str, line_number: u32) -> Result<DecodedLine, DecodeError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(DecodeError::BlankLine { line: line_number });
    }

    let Some(detected) = detect_tag(line) else {
        return Ok(DecodedLine {
            line_number,
            record_type: RecordType::Other,
            tag: None,
            fields: BTreeMap::new(),
            field_count: 0,
        });
    };

    let record_type = RecordType::from_tag(&detected.tag);
    // A drifted line is re-aligned so the table offsets apply.
    let shift = detected.offset as isize - TAG_OFFSET as isize;
    let aligned = realign(line, shift);

    let fields: BTreeMap<&'static str, FieldValue> = record_type
        .fields()
        .map(|spec| (spec.name, spec.extract(&aligned)))
        .collect();
    let field_count = fields.values().filter(|v| !v.is_null()).count();

    Ok(DecodedLine {
        line_number,
        record_type,
        tag: Some(detected.tag),
        fields,
        field_count,
    })
}

fn realign(line: &str, shift: isize) -> std::borrow::Cow<'_, str> {
    use std::borrow::Cow;
    match shift {
        0 => Cow::Borrowed(line),
        s if s > 0 => Cow::Borrowed(line.get(s as usize..).unwrap_or("")),
        s => {
            let mut padded = " ".repeat(s.unsigned_abs());
            padded.push_str(line);
            Cow::Owned(padded)
        }
    }
}

/// Writes `values` into a fixed-width line laid out for `record_type`.
///
/// Undeclared names are ignored; declared fields without a value are blank.
/// The record identifier is always written for typed records.
pub fn encode_fields(record_type: RecordType, values: &[(&str, FieldValue)]) -> String {
    let width = record_type.line_width();
    let mut line = vec![b' '; width];

    for spec in record_type.fields() {
        let value = if spec.name == "record_identifier" {
            record_type
                .tag()
                .map(|t| FieldValue::Text(t.to_string()))
                .unwrap_or(FieldValue::Null)
        } else {
            values
                .iter()
                .find(|(name, _)| *name == spec.name)
                .map(|(_, v)| v.clone())
                .unwrap_or(FieldValue::Null)
        };
        let rendered = spec.render(&value);
        let bytes = rendered.as_bytes();
        if bytes.len() == spec.len {
            line[spec.start..spec.end()].copy_from_slice(bytes);
        }
    }

    String::from_utf8_lossy(&line).into_owned()
}
