//! Declarative TDDF record layouts.
//!
//! Offsets are 0-based byte positions into an ASCII line. Every record shares
//! the [`COMMON_FIELDS`] prefix; the record identifier sits at
//! [`TAG_OFFSET`].

use super::field::{FieldSpec, Transform};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical position of the 2-character record identifier.
pub const TAG_OFFSET: usize = 17;

/// How far into a line the fallback scan looks for a tag.
pub const TAG_SCAN_WINDOW: usize = 24;

/// Tags that the codec recognises. Only the first four have field tables.
pub const RECOGNIZED_TAGS: &[&str] = &[
    "BH", "DT", "E1", "G2", "P1", "P2", "AD", "DR", "CK", "LG", "GE",
];

pub const MERCHANT_ACCOUNT: &str = "merchant_account_number";
pub const REFERENCE_NUMBER: &str = "reference_number";
pub const NET_DEPOSIT: &str = "net_deposit";
pub const TRANSACTION_AMOUNT: &str = "transaction_amount";
pub const TRANSACTION_DATE: &str = "transaction_date";
pub const BATCH_DATE: &str = "batch_date";

pub static COMMON_FIELDS: [FieldSpec; 9] = [
    FieldSpec::new("sequence_number", 0, 7, Transform::Trim),
    FieldSpec::new("entry_run_number", 7, 6, Transform::Trim),
    FieldSpec::new("sequence_within_run", 13, 4, Transform::Trim),
    FieldSpec::new("record_identifier", 17, 2, Transform::Trim),
    FieldSpec::new("bank_number", 19, 4, Transform::Trim),
    FieldSpec::new(MERCHANT_ACCOUNT, 23, 16, Transform::Trim),
    FieldSpec::new("association_number", 39, 6, Transform::Trim),
    FieldSpec::new("group_number", 45, 6, Transform::Trim),
    FieldSpec::new("transaction_code", 51, 4, Transform::Trim),
];

static BATCH_HEADER_FIELDS: [FieldSpec; 6] = [
    FieldSpec::new(BATCH_DATE, 55, 8, Transform::Date),
    FieldSpec::new("batch_julian_date", 63, 5, Transform::Trim),
    FieldSpec::new(NET_DEPOSIT, 68, 15, Transform::Amount),
    FieldSpec::new("reject_reason", 83, 4, Transform::Trim),
    FieldSpec::new("merchant_reference_number", 87, 16, Transform::Trim),
    FieldSpec::new("batch_id", 103, 24, Transform::Passthrough),
];

static DETAIL_FIELDS: [FieldSpec; 9] = [
    FieldSpec::new(REFERENCE_NUMBER, 61, 23, Transform::Trim),
    FieldSpec::new(TRANSACTION_DATE, 84, 8, Transform::Date),
    FieldSpec::new(TRANSACTION_AMOUNT, 92, 11, Transform::Amount),
    FieldSpec::new("batch_julian_date", 103, 5, Transform::Trim),
    FieldSpec::new(NET_DEPOSIT, 108, 15, Transform::Amount),
    FieldSpec::new("cardholder_account_number", 123, 19, Transform::Trim),
    FieldSpec::new("authorization_number", 142, 6, Transform::Trim),
    FieldSpec::new("debit_credit_indicator", 148, 1, Transform::Trim),
    FieldSpec::new("card_type", 149, 2, Transform::Trim),
];

static EXTENSION_A_FIELDS: [FieldSpec; 4] = [
    FieldSpec::new(REFERENCE_NUMBER, 55, 23, Transform::Trim),
    FieldSpec::new("pos_entry_mode", 78, 2, Transform::Trim),
    FieldSpec::new("terminal_id", 80, 8, Transform::Trim),
    FieldSpec::new("cashback_amount", 88, 9, Transform::Amount),
];

static EXTENSION_B_FIELDS: [FieldSpec; 5] = [
    FieldSpec::new(REFERENCE_NUMBER, 55, 23, Transform::Trim),
    FieldSpec::new("merchant_city", 78, 13, Transform::Trim),
    FieldSpec::new("merchant_state", 91, 2, Transform::Trim),
    FieldSpec::new("merchant_zip", 93, 9, Transform::Trim),
    FieldSpec::new("merchant_country", 102, 3, Transform::Trim),
];

/// Decoded record variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    BatchHeader,
    DetailTransaction,
    ExtensionA,
    ExtensionB,
    Other,
}

impl RecordType {
    /// Maps a record identifier to its variant. Unknown tags are `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "BH" => RecordType::BatchHeader,
            "DT" => RecordType::DetailTransaction,
            "E1" => RecordType::ExtensionA,
            "G2" => RecordType::ExtensionB,
            _ => RecordType::Other,
        }
    }

    /// The tag written for this variant, if it has a fixed one.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            RecordType::BatchHeader => Some("BH"),
            RecordType::DetailTransaction => Some("DT"),
            RecordType::ExtensionA => Some("E1"),
            RecordType::ExtensionB => Some("G2"),
            RecordType::Other => None,
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, RecordType::ExtensionA | RecordType::ExtensionB)
    }

    /// Type-specific fields, excluding the common prefix.
    pub fn specific_fields(&self) -> &'static [FieldSpec] {
        match self {
            RecordType::BatchHeader => &BATCH_HEADER_FIELDS,
            RecordType::DetailTransaction => &DETAIL_FIELDS,
            RecordType::ExtensionA => &EXTENSION_A_FIELDS,
            RecordType::ExtensionB => &EXTENSION_B_FIELDS,
            RecordType::Other => &[],
        }
    }

    /// Full ordered field table. `Other` has none.
    pub fn fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        let common: &'static [FieldSpec] = match self {
            RecordType::Other => &[],
            _ => &COMMON_FIELDS,
        };
        common.iter().chain(self.specific_fields().iter())
    }

    /// Length of a line that holds every declared field.
    pub fn line_width(&self) -> usize {
        self.fields().map(FieldSpec::end).max().unwrap_or(0)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::BatchHeader => "batch_header",
            RecordType::DetailTransaction => "detail_transaction",
            RecordType::ExtensionA => "extension_a",
            RecordType::ExtensionB => "extension_b",
            RecordType::Other => "other",
        };
        f.write_str(name)
    }
}

pub fn is_recognized(tag: &str) -> bool {
    RECOGNIZED_TAGS.contains(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_do_not_overlap() {
        for record_type in [
            RecordType::BatchHeader,
            RecordType::DetailTransaction,
            RecordType::ExtensionA,
            RecordType::ExtensionB,
        ] {
            let mut specs: Vec<_> = record_type.fields().collect();
            specs.sort_by_key(|s| s.start);
            for pair in specs.windows(2) {
                assert!(
                    pair[0].end() <= pair[1].start,
                    "{}: {} overlaps {}",
                    record_type,
                    pair[0].name,
                    pair[1].name
                );
            }
        }
    }

    #[test]
    fn test_tag_mapping() {
        assert_eq!(RecordType::from_tag("BH"), RecordType::BatchHeader);
        assert_eq!(RecordType::from_tag("P1"), RecordType::Other);
        assert_eq!(RecordType::ExtensionB.tag(), Some("G2"));
        assert!(is_recognized("LG"));
        assert!(!is_recognized("ZZ"));
    }

    #[test]
    fn test_other_has_no_fields() {
        assert_eq!(RecordType::Other.fields().count(), 0);
        assert_eq!(RecordType::Other.line_width(), 0);
    }
}
