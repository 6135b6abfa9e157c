//! Pipeline facade.
//!
//! Wires the store, lease coordinator and backlog processor together and
//! exposes the operations an ingest, reporting or operator collaborator
//! calls. Transport is left to the caller.

use crate::artifact::{ArtifactId, DecodedRecord, LineStatus, RawLine, UploadArtifact};
use crate::backlog::{BacklogProcessor, BatchOutcome, RequeueCriteria};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::PipelineConfig;
use crate::duplicates::{CleanupReport, DuplicateDetector, DuplicateGroup, DuplicateScope};
use crate::error::Result;
use crate::lease::{LeaseCoordinator, ProcessingLock, ResourceKey};
use crate::phase::{self, Phase, ReleaseTarget, Trigger};
use crate::resolver::{self, BatchRelationship};
use crate::store::{Page, Partition, RecordQuery, Store};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Line counts of one artifact by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LineSummary {
    pub pending: usize,
    pub processing: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl LineSummary {
    fn of(partition: &Partition) -> Self {
        LineSummary {
            pending: partition.count_status(LineStatus::Pending),
            processing: partition.count_status(LineStatus::Processing),
            processed: partition.count_status(LineStatus::Processed),
            skipped: partition.count_status(LineStatus::Skipped),
            failed: partition.count_status(LineStatus::Failed),
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.processed + self.skipped + self.failed
    }
}

/// Entry point for every pipeline operation.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<Store>,
    leases: LeaseCoordinator,
    backlog: BacklogProcessor,
    duplicates: DuplicateDetector,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a pipeline reading time from `clock`.
    pub fn with_clock(config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(Store::new(clock));
        let leases = LeaseCoordinator::new(store.clone());
        let backlog = BacklogProcessor::new(store.clone(), leases.clone());
        let duplicates = DuplicateDetector::new(store.clone());
        Pipeline {
            config,
            store,
            leases,
            backlog,
            duplicates,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn leases(&self) -> &LeaseCoordinator {
        &self.leases
    }

    pub fn backlog(&self) -> &BacklogProcessor {
        &self.backlog
    }

    pub fn duplicates(&self) -> &DuplicateDetector {
        &self.duplicates
    }

    /// Registers an uploaded file and queues it for decoding.
    ///
    /// Bytes are split into lines (`\n` or `\r\n`; invalid UTF-8 is replaced),
    /// each line's record identifier is detected and counted, and the
    /// artifact walks `Started` through `Queued` in one write. The same
    /// content submitted twice to one environment is accepted with a warning.
    pub fn submit_artifact(
        &self,
        bytes: &[u8],
        filename: &str,
        environment: &str,
    ) -> Result<ArtifactId> {
        let text = String::from_utf8_lossy(bytes);
        let lines: Vec<(String, String)> = text
            .lines()
            .map(|line| {
                let tag = codec::detect_tag(line).map(|d| d.tag).unwrap_or_default();
                (line.to_string(), tag)
            })
            .collect();
        let content_hash = format!("{:x}", md5::compute(bytes));
        let now = self.store.now();

        let (id, previous) = self.store.write(|t| -> Result<(ArtifactId, Option<ArtifactId>)> {
            let previous = t
                .artifacts
                .values()
                .find(|a| a.content_hash == content_hash && a.environment == environment)
                .map(|a| a.id);

            let id = t.next_artifact_id();
            let mut artifact = UploadArtifact {
                id,
                filename: filename.to_string(),
                size_bytes: bytes.len() as u64,
                environment: environment.to_string(),
                content_hash: content_hash.clone(),
                phase: Phase::Started,
                held_from: None,
                retry_count: 0,
                lock_owner: None,
                line_count: 0,
                tag_counts: BTreeMap::new(),
                created_at: now,
                updated_at: now,
                error_detail: None,
                history: Vec::new(),
            };
            phase::transition(&mut artifact, Phase::Uploading, Trigger::Scheduler, now)?;

            let mut partition = Partition::default();
            for (idx, (text, tag)) in lines.into_iter().enumerate() {
                *artifact.tag_counts.entry(tag.clone()).or_insert(0) += 1;
                partition.lines.push(RawLine {
                    id: t.next_line_id(),
                    artifact_id: id,
                    line_number: idx as u32 + 1,
                    text,
                    tag,
                    status: LineStatus::Pending,
                    skip_reason: None,
                    record_id: None,
                    processing_since: None,
                });
            }
            artifact.line_count = partition.lines.len();
            phase::transition(&mut artifact, Phase::Uploaded, Trigger::Scheduler, now)?;
            phase::transition(&mut artifact, Phase::Identified, Trigger::Scheduler, now)?;
            phase::transition(&mut artifact, Phase::Queued, Trigger::Scheduler, now)?;

            t.partitions.insert(id, partition);
            t.artifacts.insert(id, artifact);
            Ok((id, previous))
        })??;

        if let Some(previous) = previous {
            warn!(
                "{} ({}) has the same content as {} in {}, likely re-ingestion",
                id, filename, previous, environment
            );
        }
        info!("{} queued: {} ({} bytes)", id, filename, bytes.len());
        Ok(id)
    }

    pub fn artifact(&self, id: ArtifactId) -> Result<UploadArtifact> {
        self.store.artifact(id)
    }

    pub fn artifacts(&self) -> Result<Vec<UploadArtifact>> {
        self.store.artifacts()
    }

    pub fn raw_lines(&self, id: ArtifactId) -> Result<Vec<RawLine>> {
        self.store.raw_lines(id)
    }

    pub fn line_summary(&self, id: ArtifactId) -> Result<LineSummary> {
        self.store.read(|t| t.partition(id).map(LineSummary::of))?
    }

    pub fn get_decoded_records(&self, query: &RecordQuery, page: Page) -> Result<Vec<DecodedRecord>> {
        self.store.query_records(query, page)
    }

    /// Batches of a fully decoded artifact.
    pub fn get_batch_relationships(&self, id: ArtifactId) -> Result<Vec<BatchRelationship>> {
        resolver::resolve_artifact(&self.store, id)
    }

    pub fn get_duplicate_report(&self, scope: &DuplicateScope) -> Result<Vec<DuplicateGroup>> {
        self.duplicates.find_duplicates(scope)
    }

    /// Groups remembered by the last report or cleanup, without rescanning.
    pub fn last_duplicate_report(&self) -> Result<Vec<DuplicateGroup>> {
        self.store.read(|t| t.duplicate_groups.clone())
    }

    pub fn cleanup_duplicates(&self, scope: &DuplicateScope, dry_run: bool) -> Result<CleanupReport> {
        self.duplicates.cleanup(scope, dry_run)
    }

    pub fn get_lock_status(&self) -> Result<Vec<ProcessingLock>> {
        self.leases.locks()
    }

    pub fn sweep_stale(&self, lease_ms: i64) -> Result<usize> {
        self.leases.sweep_stale(lease_ms)
    }

    pub fn hold(&self, id: ArtifactId) -> Result<()> {
        let now = self.store.now();
        self.store
            .write(|t| t.artifact_mut(id).and_then(|a| phase::hold(a, now)))?
    }

    pub fn release(&self, id: ArtifactId, target: ReleaseTarget) -> Result<()> {
        let now = self.store.now();
        self.store
            .write(|t| t.artifact_mut(id).and_then(|a| phase::release_hold(a, target, now)))?
    }

    /// Operator retry of an errored artifact.
    pub fn retry(&self, id: ArtifactId) -> Result<()> {
        let now = self.store.now();
        let max_retries = self.config.max_retries;
        self.store.write(|t| {
            t.artifact_mut(id)
                .and_then(|a| phase::retry(a, max_retries, Trigger::Operator, now))
        })?
    }

    pub fn requeue_stuck(&self, criteria: &RequeueCriteria) -> Result<usize> {
        self.backlog.requeue_stuck(criteria)
    }

    /// Requeue criteria derived from the configuration: every record type,
    /// the configured age, bounded by the batch size.
    pub fn default_requeue_criteria(&self) -> RequeueCriteria {
        RequeueCriteria {
            record_types: Vec::new(),
            older_than_hours: self.config.requeue_after_hours,
            batch_size: self.config.batch_size,
        }
    }

    pub fn process_pending_batch(
        &self,
        owner: &str,
        artifact: Option<ArtifactId>,
    ) -> Result<BatchOutcome> {
        self.backlog.process_pending_batch(
            owner,
            artifact,
            self.config.batch_size,
            self.config.lease_ms,
        )
    }

    /// One batch of an artifact `owner` already leases; never claims.
    pub fn process_leased_batch(&self, owner: &str, artifact: ArtifactId) -> Result<BatchOutcome> {
        self.backlog
            .process_leased_batch(&ResourceKey::from(artifact), owner, self.config.batch_size)
    }

    /// Drops an artifact's whole partition. Returns whether it existed.
    pub fn purge_artifact(&self, id: ArtifactId) -> Result<bool> {
        let purged = self.store.drop_partition(id)?;
        if purged {
            info!("{} purged", id);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::PipelineError;

    fn pipeline() -> Pipeline {
        Pipeline::with_clock(PipelineConfig::default(), Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_submit_queues_with_history_and_tag_counts() {
        let p = pipeline();
        let body = format!(
            "{0}BH\r\n{0}DT\n{0}DT\nnot a record\n",
            "0".repeat(17)
        );
        let id = p.submit_artifact(body.as_bytes(), "a.tddf", "test").unwrap();

        let artifact = p.artifact(id).unwrap();
        assert_eq!(artifact.phase, Phase::Queued);
        assert_eq!(artifact.line_count, 4);
        assert_eq!(artifact.history.len(), 4);
        assert_eq!(artifact.tag_counts.get("DT"), Some(&2));
        assert_eq!(artifact.tag_counts.get("BH"), Some(&1));
        assert_eq!(artifact.tag_counts.get(""), Some(&1));
        assert_eq!(artifact.size_bytes, body.len() as u64);

        let lines = p.raw_lines(id).unwrap();
        assert!(!lines[0].text.ends_with('\r'));
        assert_eq!(p.line_summary(id).unwrap().pending, 4);
    }

    #[test]
    fn test_resubmission_is_accepted() {
        let p = pipeline();
        let a = p.submit_artifact(b"x\n", "a", "test").unwrap();
        let b = p.submit_artifact(b"x\n", "a", "test").unwrap();
        assert_ne!(a, b);
        assert_eq!(
            p.artifact(a).unwrap().content_hash,
            p.artifact(b).unwrap().content_hash
        );
    }

    #[test]
    fn test_operator_operations_on_missing_artifact() {
        let p = pipeline();
        let missing = ArtifactId(42);
        assert!(matches!(p.hold(missing), Err(PipelineError::ArtifactNotFound(_))));
        assert!(p.retry(missing).is_err());
        assert!(!p.purge_artifact(missing).unwrap());
    }

    #[test]
    fn test_purge_drops_partition() {
        let p = pipeline();
        let id = p.submit_artifact(b"line\n", "a", "test").unwrap();
        assert!(p.purge_artifact(id).unwrap());
        assert!(p.raw_lines(id).is_err());
        assert!(p.artifacts().unwrap().is_empty());
    }
}
