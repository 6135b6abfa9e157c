//! Lock/lease coordinator.
//!
//! Workers never talk to each other; they race to claim leases in the shared
//! lock table. A lease is live while `now - heartbeat_at < lease_ms`. Any
//! worker may take over a lease that is no longer live, and doing so (or
//! sweeping it) hands the resource's in-flight lines back to `pending`.

use crate::artifact::{ArtifactId, LineStatus};
use crate::error::{PipelineError, Result};
use crate::phase::{self, Phase, Trigger};
use crate::store::{Store, Tables};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A lockable processing resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ResourceKey {
    /// A whole artifact
    Artifact { artifact: ArtifactId },
    /// An inclusive line range of an artifact, for splitting very large files
    Lines {
        artifact: ArtifactId,
        first_line: u32,
        last_line: u32,
    },
}

impl ResourceKey {
    pub fn artifact(&self) -> ArtifactId {
        match self {
            ResourceKey::Artifact { artifact } | ResourceKey::Lines { artifact, .. } => *artifact,
        }
    }

    pub(crate) fn covers(&self, line_number: u32) -> bool {
        match self.lines() {
            None => true,
            Some((first, last)) => (first..=last).contains(&line_number),
        }
    }

    /// Whether both keys can touch a common line. A whole-artifact key
    /// overlaps every key of the same artifact.
    pub(crate) fn overlaps(&self, other: &ResourceKey) -> bool {
        if self.artifact() != other.artifact() {
            return false;
        }
        match (self.lines(), other.lines()) {
            (Some((a_first, a_last)), Some((b_first, b_last))) => {
                a_first <= b_last && b_first <= a_last
            }
            _ => true,
        }
    }

    fn lines(&self) -> Option<(u32, u32)> {
        match self {
            ResourceKey::Artifact { .. } => None,
            ResourceKey::Lines {
                first_line,
                last_line,
                ..
            } => Some((*first_line, *last_line)),
        }
    }
}

impl From<ArtifactId> for ResourceKey {
    fn from(artifact: ArtifactId) -> Self {
        ResourceKey::Artifact { artifact }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Artifact { artifact } => write!(f, "{}", artifact),
            ResourceKey::Lines {
                artifact,
                first_line,
                last_line,
            } => write!(f, "{}/lines-{}-{}", artifact, first_line, last_line),
        }
    }
}

/// One row of the lock table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingLock {
    pub key: ResourceKey,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub lease_ms: i64,
}

impl ProcessingLock {
    /// Milliseconds since the last heartbeat.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.heartbeat_at).num_milliseconds()
    }

    /// Whether the lease is still live measured against `lease_ms`.
    pub fn is_live(&self, now: DateTime<Utc>, lease_ms: i64) -> bool {
        self.age_ms(now) < lease_ms
    }
}

/// Puts a reclaimed resource back into its pre-claim state.
///
/// `processing` lines covered by the key return to `pending`. For a whole
/// artifact, a `Processing` phase returns to `Queued`.
pub(crate) fn reset_resource(tables: &mut Tables, key: &ResourceKey, now: DateTime<Utc>) -> usize {
    let id = key.artifact();
    let mut reset = 0;
    if let Ok(partition) = tables.partition_mut(id) {
        for line in partition
            .lines
            .iter_mut()
            .filter(|l| l.status == LineStatus::Processing && key.covers(l.line_number))
        {
            line.status = LineStatus::Pending;
            line.processing_since = None;
            reset += 1;
        }
    }
    if let ResourceKey::Artifact { .. } = key {
        if let Ok(artifact) = tables.artifact_mut(id) {
            artifact.lock_owner = None;
            if artifact.phase == Phase::Processing {
                // Processing -> Queued is always a valid edge.
                let _ = phase::transition(artifact, Phase::Queued, Trigger::Scheduler, now);
            }
        }
    }
    reset
}

/// Claims, renews, releases and sweeps leases.
#[derive(Clone)]
pub struct LeaseCoordinator {
    store: Arc<Store>,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<Store>) -> Self {
        LeaseCoordinator { store }
    }

    /// Atomically takes `key` for `owner`.
    ///
    /// Succeeds when there is no lock, when the existing lock's heartbeat is
    /// at least `lease_ms` old, or when `owner` already holds it (the lease
    /// is then renewed). Returns `false` on contention, including a live
    /// lease another owner holds on an overlapping key of the same artifact.
    /// Stale overlapping leases are taken over.
    pub fn claim(&self, key: &ResourceKey, owner: &str, lease_ms: i64) -> Result<bool> {
        let now = self.store.now();
        self.store.write(|t| {
            let overlapping: Vec<ProcessingLock> = t
                .locks
                .values()
                .filter(|l| l.key != *key && l.owner != owner && l.key.overlaps(key))
                .cloned()
                .collect();
            if let Some(live) = overlapping.iter().find(|l| l.is_live(now, lease_ms)) {
                debug!("{} overlaps {} held by {}, skipping", key, live.key, live.owner);
                return false;
            }
            for stale in &overlapping {
                t.locks.remove(&stale.key);
                let reset = reset_resource(t, &stale.key, now);
                warn!(
                    "reclaimed stale lease on {} from {} (idle {} ms, {} lines reset)",
                    stale.key,
                    stale.owner,
                    stale.age_ms(now),
                    reset
                );
            }

            let acquired_at = match t.locks.get(key).cloned() {
                Some(existing) if existing.owner == owner => existing.acquired_at,
                Some(existing) if existing.is_live(now, lease_ms) => {
                    debug!("{} is held by {}, skipping", key, existing.owner);
                    return false;
                }
                Some(existing) => {
                    let reset = reset_resource(t, key, now);
                    warn!(
                        "reclaimed stale lease on {} from {} (idle {} ms, {} lines reset)",
                        key,
                        existing.owner,
                        existing.age_ms(now),
                        reset
                    );
                    now
                }
                None => now,
            };
            t.locks.insert(
                key.clone(),
                ProcessingLock {
                    key: key.clone(),
                    owner: owner.to_string(),
                    acquired_at,
                    heartbeat_at: now,
                    lease_ms,
                },
            );
            if let ResourceKey::Artifact { artifact } = key {
                if let Ok(a) = t.artifact_mut(*artifact) {
                    a.lock_owner = Some(owner.to_string());
                }
            }
            true
        })
    }

    /// Extends the lease. An error means the caller must stop working.
    pub fn heartbeat(&self, key: &ResourceKey, owner: &str) -> Result<()> {
        let now = self.store.now();
        self.store.write(|t| match t.locks.get_mut(key) {
            Some(lock) if lock.owner == owner => {
                lock.heartbeat_at = now;
                Ok(())
            }
            _ => Err(PipelineError::LeaseLost {
                key: key.to_string(),
                owner: owner.to_string(),
            }),
        })?
    }

    /// Drops the lock if `owner` holds it. Returns whether anything was released.
    pub fn release(&self, key: &ResourceKey, owner: &str) -> Result<bool> {
        self.store.write(|t| {
            if !t.owns(key, owner) {
                return false;
            }
            t.locks.remove(key);
            if let ResourceKey::Artifact { artifact } = key {
                if let Ok(a) = t.artifact_mut(*artifact) {
                    a.lock_owner = None;
                }
            }
            true
        })
    }

    /// Deletes every lock idle for at least `lease_ms` and resets its resource.
    pub fn sweep_stale(&self, lease_ms: i64) -> Result<usize> {
        let now = self.store.now();
        self.store.write(|t| {
            let stale: Vec<ProcessingLock> = t
                .locks
                .values()
                .filter(|l| !l.is_live(now, lease_ms))
                .cloned()
                .collect();
            for lock in &stale {
                t.locks.remove(&lock.key);
                let reset = reset_resource(t, &lock.key, now);
                warn!(
                    "swept stale lease on {} held by {} (idle {} ms, {} lines reset)",
                    lock.key,
                    lock.owner,
                    lock.age_ms(now),
                    reset
                );
            }
            stale.len()
        })
    }

    pub fn is_owner(&self, key: &ResourceKey, owner: &str) -> Result<bool> {
        self.store.read(|t| t.owns(key, owner))
    }

    /// Snapshot of the lock table.
    pub fn locks(&self) -> Result<Vec<ProcessingLock>> {
        self.store.read(|t| t.locks.values().cloned().collect())
    }
}

/// Host-qualified owner id for this process: `<hostname>-<uuid>`.
pub fn new_owner_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}
