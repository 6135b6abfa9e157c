//! Field specs, transforms and extracted values.

use crate::amount::Amount;
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// How the raw slice of a field becomes a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Trimmed text; empty after trimming is null
    Trim,
    /// Integer minor units with an implied decimal point
    Amount,
    /// `MMDDCCYY`
    Date,
    /// Raw slice, untouched
    Passthrough,
}

/// One entry of a record layout: `len` characters starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub start: usize,
    pub len: usize,
    pub transform: Transform,
}

impl FieldSpec {
    pub const fn new(name: &'static str, start: usize, len: usize, transform: Transform) -> Self {
        FieldSpec {
            name,
            start,
            len,
            transform,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// The raw slice this field covers, if the line is long enough.
    ///
    /// Returns `None` instead of panicking when the range falls outside the
    /// line or splits a multi-byte character.
    pub fn slice<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.get(self.start..self.end())
    }

    /// Extracts this field from `line`. Never fails: anything unusable is null.
    pub fn extract(&self, line: &str) -> FieldValue {
        let Some(raw) = self.slice(line) else {
            return FieldValue::Null;
        };
        match self.transform {
            Transform::Trim => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    FieldValue::Null
                } else {
                    FieldValue::Text(trimmed.to_string())
                }
            }
            Transform::Passthrough => FieldValue::Text(raw.to_string()),
            Transform::Amount => Amount::parse_implied(raw)
                .map(FieldValue::Amount)
                .unwrap_or(FieldValue::Null),
            Transform::Date => parse_date(raw)
                .map(FieldValue::Date)
                .unwrap_or(FieldValue::Null),
        }
    }

    /// Renders `value` into exactly `len` characters of fixed-width text.
    pub fn render(&self, value: &FieldValue) -> String {
        let text = match value {
            FieldValue::Null => String::new(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Amount(a) => {
                let units = a.minor_units();
                if units < 0 {
                    format!("-{:0>width$}", -units, width = self.len.saturating_sub(1))
                } else {
                    format!("{:0>width$}", units, width = self.len)
                }
            }
            FieldValue::Date(d) => d.format("%m%d%Y").to_string(),
        };
        let mut out: String = text.chars().take(self.len).collect();
        while out.chars().count() < self.len {
            out.push(' ');
        }
        out
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let month: u32 = raw[0..2].parse().ok()?;
    let day: u32 = raw[2..4].parse().ok()?;
    let year: i32 = raw[4..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Text(String),
    Amount(Amount),
    Date(NaiveDate),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<Amount> {
        match self {
            FieldValue::Amount(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Amount(a) => write!(f, "{}", a),
            FieldValue::Date(d) => write!(f, "{}", d),
        }
    }
}
