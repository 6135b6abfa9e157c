//! File processing state machine.
//!
//! ```text
//! Started -> Uploading -> Uploaded -> Identified -> Queued -> Processing -> Encoded
//!                                                    ^   ^        |
//!                                                    |   +--------+ (lease reclaim, cooperative stop)
//!                                                    |            v
//!                                                    +-------- Error -> Failed (retry ceiling)
//! ```
//!
//! `Held` is reachable from every non-terminal phase and returns to the phase
//! it was held from (or `Queued`). All mutation of [`UploadArtifact::phase`]
//! goes through this module.

use crate::artifact::UploadArtifact;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of an uploaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Uploading,
    Uploaded,
    Identified,
    Queued,
    Processing,
    Encoded,
    Error,
    Held,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Encoded | Phase::Failed)
    }

    /// Edges of the graph, excluding hold/release which carry extra state.
    pub fn can_transition_to(&self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Started, Uploading)
                | (Uploading, Uploaded)
                | (Uploaded, Identified)
                | (Identified, Queued)
                | (Queued, Processing)
                | (Processing, Encoded)
                | (Processing, Error)
                | (Processing, Queued)
                | (Error, Queued)
                | (Error, Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Started => "started",
            Phase::Uploading => "uploading",
            Phase::Uploaded => "uploaded",
            Phase::Identified => "identified",
            Phase::Queued => "queued",
            Phase::Processing => "processing",
            Phase::Encoded => "encoded",
            Phase::Error => "error",
            Phase::Held => "held",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Who asked for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduler,
    Operator,
}

/// One entry in an artifact's phase history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub trigger: Trigger,
}

/// Where a released hold sends the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTarget {
    /// Back to the phase it was held from
    Prior,
    Queued,
}

fn record(artifact: &mut UploadArtifact, to: Phase, trigger: Trigger, now: DateTime<Utc>) {
    let from = artifact.phase;
    artifact.history.push(PhaseTransition {
        from,
        to,
        at: now,
        trigger,
    });
    artifact.phase = to;
    artifact.updated_at = now;
    info!("{}: {} -> {} ({:?})", artifact.id, from, to, trigger);
}

fn invalid(artifact: &UploadArtifact, to: Phase) -> PipelineError {
    PipelineError::InvalidTransition {
        artifact: artifact.id,
        from: artifact.phase,
        to,
    }
}

/// Moves the artifact along one edge of the graph.
pub fn transition(
    artifact: &mut UploadArtifact,
    to: Phase,
    trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<()> {
    if !artifact.phase.can_transition_to(to) {
        return Err(invalid(artifact, to));
    }
    if to == Phase::Encoded || to == Phase::Queued {
        artifact.error_detail = None;
    }
    record(artifact, to, trigger, now);
    Ok(())
}

/// `Processing -> Error`, keeping the reason.
pub fn mark_error(
    artifact: &mut UploadArtifact,
    detail: impl Into<String>,
    trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<()> {
    transition(artifact, Phase::Error, trigger, now)?;
    artifact.error_detail = Some(detail.into());
    Ok(())
}

/// `Error -> Queued`, or `Error -> Failed` once `max_retries` is used up.
///
/// Returns [`PipelineError::RetryExhausted`] after failing the artifact.
pub fn retry(
    artifact: &mut UploadArtifact,
    max_retries: u32,
    trigger: Trigger,
    now: DateTime<Utc>,
) -> Result<()> {
    if artifact.phase != Phase::Error {
        return Err(invalid(artifact, Phase::Queued));
    }
    if artifact.retry_count >= max_retries {
        transition(artifact, Phase::Failed, trigger, now)?;
        return Err(PipelineError::RetryExhausted {
            artifact: artifact.id,
            retries: artifact.retry_count,
        });
    }
    artifact.retry_count += 1;
    let detail = artifact.error_detail.take();
    transition(artifact, Phase::Queued, trigger, now)?;
    if let Some(detail) = detail {
        info!("{}: retry {} after: {}", artifact.id, artifact.retry_count, detail);
    }
    Ok(())
}

/// Parks a non-terminal artifact so the scheduler ignores it.
pub fn hold(artifact: &mut UploadArtifact, now: DateTime<Utc>) -> Result<()> {
    if artifact.phase.is_terminal() || artifact.phase == Phase::Held {
        return Err(invalid(artifact, Phase::Held));
    }
    artifact.held_from = Some(artifact.phase);
    record(artifact, Phase::Held, Trigger::Operator, now);
    Ok(())
}

/// Releases a hold.
///
/// An artifact held mid-processing goes back to `Queued`: whatever worker
/// owned it stopped at its next batch boundary.
pub fn release_hold(
    artifact: &mut UploadArtifact,
    target: ReleaseTarget,
    now: DateTime<Utc>,
) -> Result<()> {
    if artifact.phase != Phase::Held {
        return Err(invalid(artifact, Phase::Queued));
    }
    let prior = artifact.held_from.take().unwrap_or(Phase::Queued);
    let to = match (target, prior) {
        (ReleaseTarget::Queued, _) | (_, Phase::Processing) => Phase::Queued,
        (ReleaseTarget::Prior, prior) => prior,
    };
    record(artifact, to, Trigger::Operator, now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactId;
    use std::collections::BTreeMap;

    fn artifact(phase: Phase) -> UploadArtifact {
        UploadArtifact {
            id: ArtifactId(1),
            filename: "f.tddf".into(),
            size_bytes: 0,
            environment: "test".into(),
            content_hash: String::new(),
            phase,
            held_from: None,
            retry_count: 0,
            lock_owner: None,
            line_count: 0,
            tag_counts: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error_detail: None,
            history: Vec::new(),
        }
    }

    #[test]
    fn test_happy_path_is_recorded() {
        let mut a = artifact(Phase::Started);
        let now = Utc::now();
        for to in [
            Phase::Uploading,
            Phase::Uploaded,
            Phase::Identified,
            Phase::Queued,
            Phase::Processing,
            Phase::Encoded,
        ] {
            transition(&mut a, to, Trigger::Scheduler, now).unwrap();
        }
        assert_eq!(a.phase, Phase::Encoded);
        assert_eq!(a.history.len(), 6);
        assert_eq!(a.history[0].from, Phase::Started);
        assert!(a.history.iter().all(|t| t.trigger == Trigger::Scheduler));
    }

    #[test]
    fn test_backward_and_skipping_edges_rejected() {
        let mut a = artifact(Phase::Queued);
        assert!(transition(&mut a, Phase::Encoded, Trigger::Scheduler, Utc::now()).is_err());
        assert!(transition(&mut a, Phase::Uploaded, Trigger::Operator, Utc::now()).is_err());

        let mut done = artifact(Phase::Encoded);
        assert!(matches!(
            transition(&mut done, Phase::Queued, Trigger::Operator, Utc::now()),
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_retry_until_failed() {
        let mut a = artifact(Phase::Processing);
        let now = Utc::now();
        for attempt in 1..=2 {
            mark_error(&mut a, "boom", Trigger::Scheduler, now).unwrap();
            assert_eq!(a.error_detail.as_deref(), Some("boom"));
            retry(&mut a, 2, Trigger::Scheduler, now).unwrap();
            assert_eq!(a.phase, Phase::Queued);
            assert_eq!(a.retry_count, attempt);
            assert!(a.error_detail.is_none());
            transition(&mut a, Phase::Processing, Trigger::Scheduler, now).unwrap();
        }
        mark_error(&mut a, "boom", Trigger::Scheduler, now).unwrap();
        let err = retry(&mut a, 2, Trigger::Operator, now).unwrap_err();
        assert!(matches!(err, PipelineError::RetryExhausted { retries: 2, .. }));
        assert_eq!(a.phase, Phase::Failed);
        assert!(hold(&mut a, now).is_err());
    }

    #[test]
    fn test_hold_and_release_to_prior() {
        let mut a = artifact(Phase::Identified);
        let now = Utc::now();
        hold(&mut a, now).unwrap();
        assert_eq!(a.phase, Phase::Held);
        assert!(hold(&mut a, now).is_err());
        release_hold(&mut a, ReleaseTarget::Prior, now).unwrap();
        assert_eq!(a.phase, Phase::Identified);
        assert_eq!(a.history.last().unwrap().trigger, Trigger::Operator);
    }

    #[test]
    fn test_release_of_processing_hold_requeues() {
        let mut a = artifact(Phase::Processing);
        let now = Utc::now();
        hold(&mut a, now).unwrap();
        release_hold(&mut a, ReleaseTarget::Prior, now).unwrap();
        assert_eq!(a.phase, Phase::Queued);
    }

    #[test]
    fn test_release_to_queued() {
        let mut a = artifact(Phase::Error);
        let now = Utc::now();
        hold(&mut a, now).unwrap();
        release_hold(&mut a, ReleaseTarget::Queued, now).unwrap();
        assert_eq!(a.phase, Phase::Queued);
    }
}
