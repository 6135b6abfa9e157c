//! Polling workers.
//!
//! There is no orchestrator. Each [`Worker`] polls the shared store, claims
//! whatever queued artifact it can lease, and drives it to `Encoded`.
//! Pausing and shutdown go through an explicit [`SchedulerControl`].

use crate::artifact::ArtifactId;
use crate::backlog::BatchOutcome;
use crate::duplicates::DuplicateScope;
use crate::error::{PipelineError, Result};
use crate::lease::{self, ResourceKey};
use crate::phase::{self, Phase, Trigger};
use crate::pipeline::Pipeline;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Shared pause and shutdown flags.
#[derive(Debug, Default)]
pub struct SchedulerControl {
    paused: AtomicBool,
    shutdown: AtomicBool,
}

impl SchedulerControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops workers from starting new cycles. Work in progress finishes.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Sleeps up to `interval`, waking early on shutdown.
    fn wait(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.is_shutdown() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(25)));
        }
    }
}

/// What one [`Worker::run_cycle`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Paused,
    /// Nothing was claimable
    Idle,
    Completed {
        artifact: ArtifactId,
        lines: BatchOutcome,
        batches: usize,
        relationships: usize,
        /// Duplicate groups touching the artifact
        duplicate_groups: usize,
    },
    /// Work stopped early: the artifact was held, shut down, or its lease
    /// passed to someone else.
    Interrupted {
        artifact: ArtifactId,
        reason: String,
    },
    /// The artifact moved to `Error`.
    Errored {
        artifact: ArtifactId,
        error: String,
    },
}

enum Drained {
    Done { lines: BatchOutcome, batches: usize },
    Stopped(String),
}

/// One polling participant with its own lease owner id.
pub struct Worker {
    id: String,
    pipeline: Arc<Pipeline>,
}

impl Worker {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self::with_id(pipeline, lease::new_owner_id())
    }

    pub fn with_id(pipeline: Arc<Pipeline>, id: impl Into<String>) -> Self {
        Worker {
            id: id.into(),
            pipeline,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One poll: maintenance, then at most one artifact driven to completion.
    ///
    /// Only storage outages are returned as errors. The artifact's phase is
    /// left alone in that case and its lease lapses, so a later sweep puts it
    /// back in the queue.
    pub fn run_cycle(&self, control: &SchedulerControl) -> Result<CycleOutcome> {
        if control.is_paused() {
            return Ok(CycleOutcome::Paused);
        }
        self.maintain()?;

        let Some(artifact) = self.claim_next()? else {
            return Ok(CycleOutcome::Idle);
        };
        self.work(artifact, control)
    }

    /// Drives an artifact this worker has claimed and started.
    fn work(&self, artifact: ArtifactId, control: &SchedulerControl) -> Result<CycleOutcome> {
        let key = ResourceKey::from(artifact);

        let outcome = match self.drain_lines(artifact, &key, control) {
            Ok(Drained::Done { lines, batches }) => self.finish(artifact, &key, lines, batches),
            Ok(Drained::Stopped(reason)) => Ok(CycleOutcome::Interrupted { artifact, reason }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                self.pipeline.leases().release(&key, &self.id)?;
                Ok(outcome)
            }
            Err(e) if e.is_storage() => Err(e),
            Err(PipelineError::LeaseLost { .. }) => {
                warn!("{}: {} lost its lease", artifact, self.id);
                Ok(CycleOutcome::Interrupted {
                    artifact,
                    reason: "lease lost".to_string(),
                })
            }
            Err(e) => self.fail(artifact, &key, e),
        }
    }

    /// Runs cycles until nothing is left to claim.
    pub fn drain(&self, control: &SchedulerControl) -> Result<Vec<CycleOutcome>> {
        let mut outcomes = Vec::new();
        while !control.is_shutdown() {
            let outcome = self.run_cycle(control)?;
            let done = matches!(outcome, CycleOutcome::Idle | CycleOutcome::Paused);
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        Ok(outcomes)
    }

    fn maintain(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        pipeline.sweep_stale(pipeline.config().lease_ms)?;
        pipeline.requeue_stuck(&pipeline.default_requeue_criteria())?;

        let now = pipeline.store().now();
        let max_retries = pipeline.config().max_retries;
        pipeline.store().write(|t| {
            for artifact in t.artifacts.values_mut().filter(|a| a.phase == Phase::Error) {
                if let Err(e) = phase::retry(artifact, max_retries, Trigger::Scheduler, now) {
                    warn!("{}", e);
                }
            }
        })
    }

    /// Leases the oldest queued artifact nobody else holds and starts it.
    fn claim_next(&self) -> Result<Option<ArtifactId>> {
        let pipeline = &self.pipeline;
        let mut queued: Vec<_> = pipeline
            .artifacts()?
            .into_iter()
            .filter(|a| a.phase == Phase::Queued)
            .map(|a| (a.created_at, a.id))
            .collect();
        queued.sort();

        for (_, id) in queued {
            let key = ResourceKey::from(id);
            if !pipeline.leases().claim(&key, &self.id, pipeline.config().lease_ms)? {
                continue;
            }
            let now = pipeline.store().now();
            let started = pipeline.store().write(|t| match t.artifact_mut(id) {
                Ok(a) if a.phase == Phase::Queued => {
                    phase::transition(a, Phase::Processing, Trigger::Scheduler, now).is_ok()
                }
                _ => false,
            })?;
            if started {
                return Ok(Some(id));
            }
            // raced with a hold or another worker's completion
            pipeline.leases().release(&key, &self.id)?;
        }
        Ok(None)
    }

    fn drain_lines(
        &self,
        artifact: ArtifactId,
        key: &ResourceKey,
        control: &SchedulerControl,
    ) -> Result<Drained> {
        let pipeline = &self.pipeline;
        let mut lines = BatchOutcome::default();
        let mut batches = 0;
        loop {
            if pipeline.artifact(artifact)?.phase == Phase::Held {
                info!("{} held, {} stopping after {} batches", artifact, self.id, batches);
                return Ok(Drained::Stopped("held".to_string()));
            }
            if control.is_shutdown() {
                let now = pipeline.store().now();
                pipeline.store().write(|t| {
                    lease::reset_resource(t, key, now);
                })?;
                return Ok(Drained::Stopped("shutdown".to_string()));
            }

            // never re-claim mid-drain: a lost lease ends the cycle
            pipeline.leases().heartbeat(key, &self.id)?;
            let outcome = pipeline.process_leased_batch(&self.id, artifact)?;
            if outcome.total() == 0 {
                return Ok(Drained::Done { lines, batches });
            }
            lines += outcome;
            batches += 1;
            debug!("{}: batch {} done ({} lines)", artifact, batches, outcome.total());
        }
    }

    fn finish(
        &self,
        artifact: ArtifactId,
        key: &ResourceKey,
        lines: BatchOutcome,
        batches: usize,
    ) -> Result<CycleOutcome> {
        let pipeline = &self.pipeline;
        if pipeline.artifact(artifact)?.phase == Phase::Held {
            return Ok(CycleOutcome::Interrupted {
                artifact,
                reason: "held".to_string(),
            });
        }
        let relationships = pipeline.get_batch_relationships(artifact)?;
        let duplicates = pipeline
            .duplicates()
            .find_duplicates(&DuplicateScope::artifact(artifact))?;
        if !duplicates.is_empty() {
            warn!("{}: {} duplicate groups found", artifact, duplicates.len());
        }
        let now = pipeline.store().now();
        let encoded = pipeline.store().write(|t| -> Result<bool> {
            if !t.owns(key, &self.id) {
                return Err(PipelineError::LeaseLost {
                    key: key.to_string(),
                    owner: self.id.clone(),
                });
            }
            let a = t.artifact_mut(artifact)?;
            if a.phase == Phase::Held {
                return Ok(false);
            }
            phase::transition(a, Phase::Encoded, Trigger::Scheduler, now)?;
            Ok(true)
        })??;

        if !encoded {
            return Ok(CycleOutcome::Interrupted {
                artifact,
                reason: "held".to_string(),
            });
        }
        info!(
            "{} encoded: {} processed, {} skipped, {} batches resolved",
            artifact,
            lines.processed,
            lines.skipped,
            relationships.len()
        );
        Ok(CycleOutcome::Completed {
            artifact,
            lines,
            batches,
            relationships: relationships.len(),
            duplicate_groups: duplicates.len(),
        })
    }

    fn fail(
        &self,
        artifact: ArtifactId,
        key: &ResourceKey,
        error: PipelineError,
    ) -> Result<CycleOutcome> {
        let pipeline = &self.pipeline;
        let detail = error.to_string();
        warn!("{}: {}", artifact, detail);
        let now = pipeline.store().now();
        pipeline.store().write(|t| {
            if let Ok(a) = t.artifact_mut(artifact) {
                if a.phase == Phase::Processing {
                    let _ = phase::mark_error(a, detail.clone(), Trigger::Scheduler, now);
                }
            }
        })?;
        pipeline.leases().release(key, &self.id)?;
        Ok(CycleOutcome::Errored {
            artifact,
            error: detail,
        })
    }
}

/// A set of worker threads sharing one [`SchedulerControl`].
pub struct Scheduler {
    control: Arc<SchedulerControl>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts `workers` polling threads.
    pub fn spawn(pipeline: Arc<Pipeline>, workers: usize) -> Result<Self> {
        let control = Arc::new(SchedulerControl::new());
        let poll = pipeline.config().poll_interval();
        let mut handles = Vec::with_capacity(workers);

        for n in 0..workers {
            let worker = Worker::new(pipeline.clone());
            let control = control.clone();
            let handle = thread::Builder::new()
                .name(format!("tddf-worker-{}", n))
                .spawn(move || poll_loop(&worker, &control, poll))?;
            handles.push(handle);
        }
        info!("scheduler started with {} workers", workers);
        Ok(Scheduler { control, handles })
    }

    pub fn control(&self) -> &Arc<SchedulerControl> {
        &self.control
    }

    /// Signals shutdown and waits for every worker to stop.
    pub fn shutdown(self) {
        self.control.shutdown();
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("a worker thread panicked");
            }
        }
    }
}

fn poll_loop(worker: &Worker, control: &SchedulerControl, poll: Duration) {
    debug!("worker {} polling every {:?}", worker.id(), poll);
    while !control.is_shutdown() {
        match worker.run_cycle(control) {
            Ok(CycleOutcome::Idle | CycleOutcome::Paused) => control.wait(poll),
            Ok(outcome) => debug!("worker {}: {:?}", worker.id(), outcome),
            Err(e) => {
                warn!("worker {}: {}", worker.id(), e);
                control.wait(poll);
            }
        }
    }
}
