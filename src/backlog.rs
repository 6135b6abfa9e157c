//! Backlog/retry processor.
//!
//! Takes bounded batches of `pending` lines under an artifact lease, decodes
//! them outside the store lock, and commits the results in one write. A line
//! that fails to decode is skipped with a reason; the batch carries on.

use crate::artifact::{ArtifactId, DecodedRecord, LineId, LineStatus};
use crate::codec::{self, DecodedLine};
use crate::error::{PipelineError, Result};
use crate::lease::{LeaseCoordinator, ResourceKey};
use crate::phase::{self, Phase, Trigger};
use crate::store::{Store, Tables};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::Arc;

/// Per-call line counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Lines decoded and stored
    pub processed: usize,
    /// Lines that could not be decoded
    pub skipped: usize,
    /// Lines whose result could not be committed because they were
    /// reset by someone else while in flight
    pub errors: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.processed + self.skipped + self.errors
    }
}

impl AddAssign for BatchOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.skipped += rhs.skipped;
        self.errors += rhs.errors;
    }
}

/// Which stuck work to hand back to the backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueCriteria {
    /// Record identifiers to consider; empty means all.
    pub record_types: Vec<String>,
    pub older_than_hours: i64,
    /// Upper bound on resets per call.
    pub batch_size: usize,
}

enum LineResult {
    Decoded(DecodedLine),
    Skipped(String),
}

struct TakenLine {
    id: LineId,
    line_number: u32,
    text: String,
}

/// Drives raw lines through the codec.
#[derive(Clone)]
pub struct BacklogProcessor {
    store: Arc<Store>,
    leases: LeaseCoordinator,
}

impl BacklogProcessor {
    pub fn new(store: Arc<Store>, leases: LeaseCoordinator) -> Self {
        BacklogProcessor { store, leases }
    }

    /// Decodes up to `batch_size` pending lines.
    ///
    /// With `artifact` set only that artifact is touched; otherwise pending
    /// lines are taken from `Queued` or `Processing` artifacts in id order.
    /// Each artifact is worked under its lease: one that another owner holds
    /// is skipped this round, and a lease taken here is released again before
    /// returning. Artifacts in any other phase are never touched.
    pub fn process_pending_batch(
        &self,
        owner: &str,
        artifact: Option<ArtifactId>,
        batch_size: usize,
        lease_ms: i64,
    ) -> Result<BatchOutcome> {
        let candidates: Vec<ArtifactId> = match artifact {
            Some(id) => vec![id],
            None => self.store.read(|t| {
                t.partitions
                    .iter()
                    .filter(|(_, p)| p.count_status(LineStatus::Pending) > 0)
                    .map(|(id, _)| *id)
                    .collect()
            })?,
        };

        let mut outcome = BatchOutcome::default();
        for id in candidates {
            let budget = batch_size.saturating_sub(outcome.total());
            if budget == 0 {
                break;
            }
            if !self.is_decodable(id)? {
                debug!("{} is not queued or processing, not starting new work", id);
                continue;
            }

            let key = ResourceKey::from(id);
            let already_owned = self.leases.is_owner(&key, owner)?;
            if !already_owned && !self.leases.claim(&key, owner, lease_ms)? {
                debug!("{} is leased elsewhere, skipping this round", id);
                continue;
            }

            let result = self.process_artifact_lines(&key, owner, budget);
            if !already_owned {
                self.leases.release(&key, owner)?;
            }
            outcome += result?;
        }
        Ok(outcome)
    }

    /// Decodes up to `batch_size` pending lines of a resource `owner` already
    /// leases. Never claims: without the lease this fails with `LeaseLost`.
    pub fn process_leased_batch(
        &self,
        key: &ResourceKey,
        owner: &str,
        batch_size: usize,
    ) -> Result<BatchOutcome> {
        if !self.is_decodable(key.artifact())? {
            debug!("{} is not queued or processing, nothing taken", key);
            return Ok(BatchOutcome::default());
        }
        self.process_artifact_lines(key, owner, batch_size)
    }

    /// Only queued or in-flight artifacts may have lines decoded.
    fn is_decodable(&self, id: ArtifactId) -> Result<bool> {
        self.store
            .read(|t| t.artifact(id).map(|a| matches!(a.phase, Phase::Queued | Phase::Processing)))?
    }

    fn process_artifact_lines(
        &self,
        key: &ResourceKey,
        owner: &str,
        budget: usize,
    ) -> Result<BatchOutcome> {
        let now = self.store.now();
        let id = key.artifact();
        let taken = self
            .store
            .write(|t| take_pending(t, key, owner, budget, now))??;
        if taken.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let results: Vec<(TakenLine, LineResult)> = taken
            .into_iter()
            .map(|line| {
                let result = match codec::decode(&line.text, line.line_number) {
                    Ok(decoded) => LineResult::Decoded(decoded),
                    Err(e) => LineResult::Skipped(e.to_string()),
                };
                (line, result)
            })
            .collect();

        if let Err(e) = self.leases.heartbeat(key, owner) {
            warn!("{}: lease lost mid-batch, abandoning {} lines", id, results.len());
            return Err(e);
        }

        let now = self.store.now();
        let outcome = self
            .store
            .write(|t| commit_results(t, key, owner, results, now))??;
        debug!(
            "{}: {} processed, {} skipped, {} errors",
            id, outcome.processed, outcome.skipped, outcome.errors
        );
        Ok(outcome)
    }

    /// Hands lines (and artifacts) stuck in `processing` back to the backlog.
    ///
    /// Lines taken longer than `older_than_hours` ago return to `pending`;
    /// artifacts sitting in `Processing` that long without a live lease return
    /// to `Queued`. At most `batch_size` resets happen per call.
    pub fn requeue_stuck(&self, criteria: &RequeueCriteria) -> Result<usize> {
        let now = self.store.now();
        let cutoff = Some(criteria.older_than_hours)
            .filter(|hours| *hours >= 0)
            .and_then(Duration::try_hours)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| PipelineError::InvalidConfig {
                key: "older_than_hours".to_string(),
                value: criteria.older_than_hours.to_string(),
            })?;
        let requeued = self.store.write(|t| {
            let mut requeued = 0;
            let ids: Vec<ArtifactId> = t.partitions.keys().copied().collect();
            for id in ids {
                if requeued >= criteria.batch_size {
                    break;
                }
                requeued += requeue_lines(t, id, criteria, cutoff, criteria.batch_size - requeued);
                if requeued < criteria.batch_size && requeue_artifact(t, id, cutoff, now) {
                    requeued += 1;
                }
            }
            requeued
        })?;
        if requeued > 0 {
            info!("requeued {} stuck items older than {}h", requeued, criteria.older_than_hours);
        }
        Ok(requeued)
    }
}

fn lease_lost(key: &ResourceKey, owner: &str) -> PipelineError {
    PipelineError::LeaseLost {
        key: key.to_string(),
        owner: owner.to_string(),
    }
}

/// Marks up to `budget` pending lines covered by `key` `processing`, in
/// line order.
fn take_pending(
    t: &mut Tables,
    key: &ResourceKey,
    owner: &str,
    budget: usize,
    now: DateTime<Utc>,
) -> Result<Vec<TakenLine>> {
    if !t.owns(key, owner) {
        return Err(lease_lost(key, owner));
    }
    let partition = t.partition_mut(key.artifact())?;
    Ok(partition
        .lines
        .iter_mut()
        .filter(|l| l.status == LineStatus::Pending && key.covers(l.line_number))
        .take(budget)
        .map(|l| {
            l.status = LineStatus::Processing;
            l.processing_since = Some(now);
            TakenLine {
                id: l.id,
                line_number: l.line_number,
                text: l.text.clone(),
            }
        })
        .collect())
}

/// Persists decoded records and settles line statuses.
///
/// Only the current lease owner may write. A line that is no longer
/// `processing` was reset underneath us and is counted as an error.
fn commit_results(
    t: &mut Tables,
    key: &ResourceKey,
    owner: &str,
    results: Vec<(TakenLine, LineResult)>,
    now: DateTime<Utc>,
) -> Result<BatchOutcome> {
    if !t.owns(key, owner) {
        return Err(lease_lost(key, owner));
    }
    let artifact_id = key.artifact();
    let mut outcome = BatchOutcome::default();

    for (taken, result) in results {
        let still_ours = t
            .partition(artifact_id)?
            .line(taken.line_number)
            .is_some_and(|l| l.id == taken.id && l.status == LineStatus::Processing);
        if !still_ours {
            outcome.errors += 1;
            continue;
        }

        match result {
            LineResult::Decoded(decoded) => {
                let record_id = t.next_record_id();
                let line_number = decoded.line_number;
                let record =
                    DecodedRecord::from_decoded(record_id, artifact_id, taken.id, decoded, now);
                let partition = t.partition_mut(artifact_id)?;
                partition.records.insert(line_number, record);
                if let Some(line) = partition.line_mut(line_number) {
                    line.status = LineStatus::Processed;
                    line.record_id = Some(record_id);
                    line.processing_since = None;
                }
                outcome.processed += 1;
            }
            LineResult::Skipped(reason) => {
                warn!("{} line {}: skipped: {}", artifact_id, taken.line_number, reason);
                if let Some(line) = t.partition_mut(artifact_id)?.line_mut(taken.line_number) {
                    line.status = LineStatus::Skipped;
                    line.skip_reason = Some(reason);
                    line.processing_since = None;
                }
                outcome.skipped += 1;
            }
        }
    }
    Ok(outcome)
}

fn requeue_lines(
    t: &mut Tables,
    id: ArtifactId,
    criteria: &RequeueCriteria,
    cutoff: DateTime<Utc>,
    budget: usize,
) -> usize {
    let Ok(partition) = t.partition_mut(id) else {
        return 0;
    };
    let mut reset = 0;
    for line in partition.lines.iter_mut().filter(|l| {
        l.status == LineStatus::Processing
            && l.processing_since.is_some_and(|since| since <= cutoff)
            && (criteria.record_types.is_empty() || criteria.record_types.contains(&l.tag))
    }) {
        if reset >= budget {
            break;
        }
        line.status = LineStatus::Pending;
        line.processing_since = None;
        reset += 1;
    }
    reset
}

fn requeue_artifact(t: &mut Tables, id: ArtifactId, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let key = ResourceKey::from(id);
    let live_lock = t
        .locks
        .get(&key)
        .is_some_and(|l| l.is_live(now, l.lease_ms));
    if live_lock {
        return false;
    }
    let Ok(artifact) = t.artifact_mut(id) else {
        return false;
    };
    if artifact.phase != Phase::Processing || artifact.updated_at > cutoff {
        return false;
    }
    artifact.lock_owner = None;
    let requeued = phase::transition(artifact, Phase::Queued, Trigger::Scheduler, now).is_ok();
    if requeued {
        t.locks.remove(&key);
    }
    requeued
}
