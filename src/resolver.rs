//! Batch/detail relationship resolver.
//!
//! One forward pass over an artifact's records in line order. A batch header
//! opens a batch scoped to its merchant account; detail and extension records
//! of the same merchant join it until the next header or end of file.
//! Extensions additionally attach to the nearest preceding detail that shares
//! their reference number.

use crate::amount::Amount;
use crate::artifact::{ArtifactId, DecodedRecord, RecordId};
use crate::codec::{layout, FieldValue, RecordType};
use crate::error::{PipelineError, Result};
use crate::store::Store;
use log::{debug, warn};
use serde::Serialize;

/// A detail record and the extensions tied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetailLink {
    pub record_id: RecordId,
    pub line_number: u32,
    pub reference_number: Option<String>,
    pub amount: Option<Amount>,
    pub extensions: Vec<RecordId>,
}

/// One resolved batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchRelationship {
    pub artifact_id: ArtifactId,
    pub header_record_id: RecordId,
    pub header_line: u32,
    /// Line of the next batch header; `None` when the batch runs to end of file.
    pub next_header_line: Option<u32>,
    pub merchant_account: Option<String>,
    /// Detail and extension record ids in line order.
    pub child_ids: Vec<RecordId>,
    pub details: Vec<DetailLink>,
    /// Extensions of this batch that matched no detail.
    pub batch_extensions: Vec<RecordId>,
    pub detail_amount_total: Amount,
    pub declared_net_deposit: Option<Amount>,
    /// `declared_net_deposit - detail_amount_total`
    pub variance: Option<Amount>,
}

impl BatchRelationship {
    pub fn detail_count(&self) -> usize {
        self.details.len()
    }

    pub fn extension_count(&self) -> usize {
        self.child_ids.len() - self.details.len()
    }

    pub fn has_variance(&self) -> bool {
        self.variance.is_some_and(|v| !v.is_zero())
    }
}

fn merchant_of(record: &DecodedRecord) -> Option<String> {
    record.text(layout::MERCHANT_ACCOUNT).map(str::to_string)
}

fn reference_of(record: &DecodedRecord) -> Option<String> {
    record.text(layout::REFERENCE_NUMBER).map(str::to_string)
}

fn amount_of(record: &DecodedRecord, field: &str) -> Option<Amount> {
    record.field(field).and_then(FieldValue::as_amount)
}

fn open_batch(header: &DecodedRecord) -> BatchRelationship {
    BatchRelationship {
        artifact_id: header.artifact_id,
        header_record_id: header.id,
        header_line: header.line_number,
        next_header_line: None,
        merchant_account: merchant_of(header),
        child_ids: Vec::new(),
        details: Vec::new(),
        batch_extensions: Vec::new(),
        detail_amount_total: Amount::ZERO,
        declared_net_deposit: amount_of(header, layout::NET_DEPOSIT),
        variance: None,
    }
}

fn close_batch(mut batch: BatchRelationship, next_header_line: Option<u32>) -> BatchRelationship {
    batch.next_header_line = next_header_line;
    batch.detail_amount_total = batch.details.iter().filter_map(|d| d.amount).sum();
    batch.variance = batch
        .declared_net_deposit
        .map(|declared| declared - batch.detail_amount_total);
    if batch.has_variance() {
        warn!(
            "{} batch at line {}: declared {} vs details {} (variance {})",
            batch.artifact_id,
            batch.header_line,
            batch
                .declared_net_deposit
                .map(|d| d.to_string())
                .unwrap_or_default(),
            batch.detail_amount_total,
            batch.variance.map(|v| v.to_string()).unwrap_or_default()
        );
    }
    batch
}

/// Resolves batches from one artifact's records.
///
/// `records` must be the complete record set of a single artifact; they are
/// sorted by line number here.
pub fn resolve_batches(records: &[DecodedRecord]) -> Vec<BatchRelationship> {
    let mut ordered: Vec<&DecodedRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.line_number);

    let mut batches = Vec::new();
    let mut active: Option<BatchRelationship> = None;
    let mut orphans = 0usize;

    for record in ordered {
        match record.record_type {
            RecordType::BatchHeader => {
                if let Some(done) = active.take() {
                    batches.push(close_batch(done, Some(record.line_number)));
                }
                active = Some(open_batch(record));
            }
            RecordType::DetailTransaction | RecordType::ExtensionA | RecordType::ExtensionB => {
                let Some(batch) = active
                    .as_mut()
                    .filter(|b| b.merchant_account == merchant_of(record))
                else {
                    orphans += 1;
                    continue;
                };
                batch.child_ids.push(record.id);
                if record.record_type == RecordType::DetailTransaction {
                    batch.details.push(DetailLink {
                        record_id: record.id,
                        line_number: record.line_number,
                        reference_number: reference_of(record),
                        amount: amount_of(record, layout::TRANSACTION_AMOUNT),
                        extensions: Vec::new(),
                    });
                    continue;
                }
                let reference = reference_of(record);
                let parent = reference.as_ref().and_then(|r| {
                    batch
                        .details
                        .iter_mut()
                        .rev()
                        .find(|d| d.reference_number.as_ref() == Some(r))
                });
                match parent {
                    Some(detail) => detail.extensions.push(record.id),
                    None => batch.batch_extensions.push(record.id),
                }
            }
            RecordType::Other => {}
        }
    }
    if let Some(done) = active.take() {
        batches.push(close_batch(done, None));
    }
    if orphans > 0 {
        debug!("{} detail/extension records outside any matching batch", orphans);
    }
    batches
}

/// Resolves batches for a fully decoded artifact.
///
/// Refuses with [`PipelineError::ArtifactBusy`] while any line is still
/// pending or processing.
pub fn resolve_artifact(store: &Store, artifact: ArtifactId) -> Result<Vec<BatchRelationship>> {
    let records = store.read(|t| -> Result<Vec<DecodedRecord>> {
        let partition = t.partition(artifact)?;
        let outstanding = partition.outstanding();
        if outstanding > 0 {
            return Err(PipelineError::ArtifactBusy {
                artifact,
                outstanding,
            });
        }
        Ok(partition.records.values().cloned().collect())
    })??;
    Ok(resolve_batches(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(
        id: u64,
        line: u32,
        record_type: RecordType,
        fields: &[(&'static str, FieldValue)],
    ) -> DecodedRecord {
        DecodedRecord {
            id: RecordId(id),
            artifact_id: ArtifactId(1),
            raw_line_id: crate::artifact::LineId(id),
            line_number: line,
            record_type,
            tag: record_type.tag().map(str::to_string),
            fields: fields.iter().cloned().collect::<BTreeMap<_, _>>(),
            field_count: fields.len(),
            created_at: Utc::now(),
        }
    }

    fn merchant(m: &str) -> (&'static str, FieldValue) {
        (layout::MERCHANT_ACCOUNT, FieldValue::Text(m.to_string()))
    }

    fn reference(r: &str) -> (&'static str, FieldValue) {
        (layout::REFERENCE_NUMBER, FieldValue::Text(r.to_string()))
    }

    fn money(field: &'static str, cents: i64) -> (&'static str, FieldValue) {
        (field, FieldValue::Amount(Amount::from_minor_units(cents)))
    }

    fn five_line_artifact(declared: i64) -> Vec<DecodedRecord> {
        vec![
            record(1, 1, RecordType::BatchHeader, &[merchant("M1"), money(layout::NET_DEPOSIT, declared)]),
            record(2, 2, RecordType::DetailTransaction, &[merchant("M1"), reference("R1"), money(layout::TRANSACTION_AMOUNT, 1000)]),
            record(3, 3, RecordType::DetailTransaction, &[merchant("M1"), reference("R2"), money(layout::TRANSACTION_AMOUNT, 2500)]),
            record(4, 4, RecordType::ExtensionA, &[merchant("M1"), reference("R2")]),
            record(5, 5, RecordType::BatchHeader, &[merchant("M2"), money(layout::NET_DEPOSIT, 0)]),
        ]
    }

    #[test]
    fn test_five_line_scenario() {
        let batches = resolve_batches(&five_line_artifact(3000));
        assert_eq!(batches.len(), 2);

        let first = &batches[0];
        assert_eq!(first.detail_count(), 2);
        assert_eq!(first.extension_count(), 1);
        assert!(first.details[0].extensions.is_empty());
        assert_eq!(first.details[1].extensions, vec![RecordId(4)]);
        assert_eq!(first.child_ids, vec![RecordId(2), RecordId(3), RecordId(4)]);
        assert_eq!(first.detail_amount_total, Amount::from_minor_units(3500));
        assert_eq!(first.variance, Some(Amount::from_minor_units(-500)));
        assert!(first.has_variance());
        assert_eq!(first.next_header_line, Some(5));

        let second = &batches[1];
        assert!(second.child_ids.is_empty());
        assert_eq!(second.next_header_line, None);
        assert!(!second.has_variance());
    }

    #[test]
    fn test_matching_deposit_has_zero_variance() {
        let batches = resolve_batches(&five_line_artifact(3500));
        assert_eq!(batches[0].variance, Some(Amount::ZERO));
        assert!(!batches[0].has_variance());
    }

    #[test]
    fn test_children_fall_strictly_between_headers() {
        let mut records = five_line_artifact(0);
        records.reverse();
        for batch in resolve_batches(&records) {
            let upper = batch.next_header_line.unwrap_or(u32::MAX);
            for detail in &batch.details {
                assert!(detail.line_number > batch.header_line);
                assert!(detail.line_number < upper);
            }
        }
    }

    #[test]
    fn test_other_merchant_and_leading_details_are_orphans() {
        let records = vec![
            record(1, 1, RecordType::DetailTransaction, &[merchant("M1")]),
            record(2, 2, RecordType::BatchHeader, &[merchant("M1")]),
            record(3, 3, RecordType::DetailTransaction, &[merchant("M9")]),
            record(4, 4, RecordType::ExtensionB, &[merchant("M1"), reference("NOPE")]),
        ];
        let batches = resolve_batches(&records);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].details.is_empty());
        assert_eq!(batches[0].batch_extensions, vec![RecordId(4)]);
        assert_eq!(batches[0].declared_net_deposit, None);
        assert_eq!(batches[0].variance, None);
    }

    #[test]
    fn test_extension_binds_to_nearest_preceding_detail() {
        let records = vec![
            record(1, 1, RecordType::BatchHeader, &[merchant("M1")]),
            record(2, 2, RecordType::DetailTransaction, &[merchant("M1"), reference("R")]),
            record(3, 3, RecordType::DetailTransaction, &[merchant("M1"), reference("R")]),
            record(4, 4, RecordType::ExtensionB, &[merchant("M1"), reference("R")]),
        ];
        let batches = resolve_batches(&records);
        assert!(batches[0].details[0].extensions.is_empty());
        assert_eq!(batches[0].details[1].extensions, vec![RecordId(4)]);
    }
}
