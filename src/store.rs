//! Partitioned, append-only record store.
//!
//! Every artifact owns one [`Partition`] holding its raw lines (indexed by
//! line number) and its decoded records (keyed by line number). Lock and
//! duplicate-group tables sit beside the partitions. Everything lives behind
//! one mutex, so a closure passed to [`Store::write`] is a transaction.

use crate::artifact::{
    ArtifactId, DecodedRecord, LineId, LineStatus, RawLine, RecordId, UploadArtifact,
};
use crate::clock::Clock;
use crate::codec::{layout, FieldValue, RecordType};
use crate::duplicates::{self, DuplicateGroup};
use crate::error::{PipelineError, Result};
use crate::lease::{ProcessingLock, ResourceKey};
use chrono::{DateTime, NaiveDate, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Raw lines and decoded records of one artifact.
#[derive(Debug, Default)]
pub struct Partition {
    /// `lines[n - 1]` is line `n`
    pub lines: Vec<RawLine>,
    pub records: BTreeMap<u32, DecodedRecord>,
}

impl Partition {
    pub fn line(&self, line_number: u32) -> Option<&RawLine> {
        let idx = (line_number as usize).checked_sub(1)?;
        self.lines.get(idx)
    }

    pub fn line_mut(&mut self, line_number: u32) -> Option<&mut RawLine> {
        let idx = (line_number as usize).checked_sub(1)?;
        self.lines.get_mut(idx)
    }

    pub fn count_status(&self, status: LineStatus) -> usize {
        self.lines.iter().filter(|l| l.status == status).count()
    }

    pub fn outstanding(&self) -> usize {
        self.lines.iter().filter(|l| l.status.is_outstanding()).count()
    }
}

/// All tables of the store.
#[derive(Debug, Default)]
pub struct Tables {
    pub artifacts: BTreeMap<ArtifactId, UploadArtifact>,
    pub partitions: BTreeMap<ArtifactId, Partition>,
    pub locks: BTreeMap<ResourceKey, ProcessingLock>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    next_artifact: u64,
    next_line: u64,
    next_record: u64,
}

impl Tables {
    pub fn next_artifact_id(&mut self) -> ArtifactId {
        self.next_artifact += 1;
        ArtifactId(self.next_artifact)
    }

    pub fn next_line_id(&mut self) -> LineId {
        self.next_line += 1;
        LineId(self.next_line)
    }

    pub fn next_record_id(&mut self) -> RecordId {
        self.next_record += 1;
        RecordId(self.next_record)
    }

    pub fn artifact(&self, id: ArtifactId) -> Result<&UploadArtifact> {
        self.artifacts
            .get(&id)
            .ok_or(PipelineError::ArtifactNotFound(id))
    }

    pub fn artifact_mut(&mut self, id: ArtifactId) -> Result<&mut UploadArtifact> {
        self.artifacts
            .get_mut(&id)
            .ok_or(PipelineError::ArtifactNotFound(id))
    }

    pub fn partition(&self, id: ArtifactId) -> Result<&Partition> {
        self.partitions
            .get(&id)
            .ok_or(PipelineError::ArtifactNotFound(id))
    }

    pub fn partition_mut(&mut self, id: ArtifactId) -> Result<&mut Partition> {
        self.partitions
            .get_mut(&id)
            .ok_or(PipelineError::ArtifactNotFound(id))
    }

    /// True when `owner` currently holds the lock on `key`.
    pub fn owns(&self, key: &ResourceKey, owner: &str) -> bool {
        self.locks.get(key).is_some_and(|l| l.owner == owner)
    }
}

/// Filter for [`Store::query_records`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordQuery {
    pub artifact: Option<ArtifactId>,
    pub merchant_account: Option<String>,
    /// Inclusive range over the transaction or batch date.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub record_type: Option<RecordType>,
}

impl RecordQuery {
    pub fn artifact(id: ArtifactId) -> Self {
        RecordQuery {
            artifact: Some(id),
            ..Default::default()
        }
    }

    fn matches(&self, record: &DecodedRecord) -> bool {
        if self.artifact.is_some_and(|a| a != record.artifact_id) {
            return false;
        }
        if self.record_type.is_some_and(|t| t != record.record_type) {
            return false;
        }
        if let Some(merchant) = &self.merchant_account {
            if record.text(layout::MERCHANT_ACCOUNT) != Some(merchant.as_str()) {
                return false;
            }
        }
        if let Some((from, to)) = self.date_range {
            let date = record
                .field(layout::TRANSACTION_DATE)
                .or_else(|| record.field(layout::BATCH_DATE))
                .and_then(FieldValue::as_date);
            match date {
                Some(d) if d >= from && d <= to => {}
                _ => return false,
            }
        }
        true
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Page { offset: 0, limit }
    }
}

/// The shared store.
pub struct Store {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl Store {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Store {
            tables: Mutex::new(Tables::default()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn guard(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| PipelineError::StorageUnavailable("store mutex poisoned".to_string()))
    }

    /// Runs `f` with shared access to the tables.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let tables = self.guard()?;
        Ok(f(&tables))
    }

    /// Runs `f` atomically with exclusive access to the tables.
    pub fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self.guard()?;
        Ok(f(&mut tables))
    }

    /// Makes the store usable again after a writer crashed mid-transaction.
    /// Tables are kept as the crashed writer left them.
    pub fn recover(&self) {
        if self.tables.is_poisoned() {
            warn!("store recovered after a crashed writer");
            self.tables.clear_poison();
        }
    }

    pub fn artifact(&self, id: ArtifactId) -> Result<UploadArtifact> {
        self.read(|t| t.artifact(id).cloned())?
    }

    pub fn artifacts(&self) -> Result<Vec<UploadArtifact>> {
        self.read(|t| t.artifacts.values().cloned().collect())
    }

    pub fn raw_lines(&self, id: ArtifactId) -> Result<Vec<RawLine>> {
        self.read(|t| t.partition(id).map(|p| p.lines.clone()))?
    }

    /// Decoded records of one artifact in ascending line order.
    pub fn records(&self, id: ArtifactId) -> Result<Vec<DecodedRecord>> {
        self.read(|t| t.partition(id).map(|p| p.records.values().cloned().collect()))?
    }

    pub fn query_records(&self, query: &RecordQuery, page: Page) -> Result<Vec<DecodedRecord>> {
        self.read(|t| {
            let partitions: Vec<&Partition> = match query.artifact {
                Some(id) => t.partitions.get(&id).into_iter().collect(),
                None => t.partitions.values().collect(),
            };
            partitions
                .into_iter()
                .flat_map(|p| p.records.values())
                .filter(|r| query.matches(r))
                .skip(page.offset)
                .take(page.limit)
                .cloned()
                .collect()
        })
    }

    /// Drops an artifact together with its whole partition and locks.
    pub fn drop_partition(&self, id: ArtifactId) -> Result<bool> {
        self.write(|t| {
            t.locks.retain(|key, _| key.artifact() != id);
            let partition = t.partitions.remove(&id);
            if let Some(partition) = &partition {
                let purged: BTreeSet<RecordId> = partition.records.values().map(|r| r.id).collect();
                duplicates::forget_artifact(&mut t.duplicate_groups, id, &purged);
            }
            t.artifacts.remove(&id).is_some() || partition.is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_ids_are_monotonic() {
        let mut t = Tables::default();
        assert_eq!(t.next_artifact_id(), ArtifactId(1));
        assert_eq!(t.next_artifact_id(), ArtifactId(2));
        assert_eq!(t.next_record_id(), RecordId(1));
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let store = Store::new(Arc::new(ManualClock::default()));
        assert!(matches!(
            store.artifact(ArtifactId(9)),
            Err(PipelineError::ArtifactNotFound(ArtifactId(9)))
        ));
        assert!(store.records(ArtifactId(9)).is_err());
    }

    #[test]
    fn test_poisoned_store_is_unavailable() {
        let store = Arc::new(Store::new(Arc::new(ManualClock::default())));
        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _ = poisoner.write(|_| panic!("writer crashed"));
        })
        .join();

        let err = store.artifacts().unwrap_err();
        assert!(err.is_storage());

        store.recover();
        assert!(store.artifacts().unwrap().is_empty());
    }
}
