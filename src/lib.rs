//! # TDDF Pipeline
//!
//! Decodes fixed-width TDDF settlement files and drives them through a
//! concurrent, exactly-once processing pipeline.
//!
//! ## Design Principles
//!
//! - **Lossless fixed point**: amounts carry two implied decimals via `rust_decimal`
//! - **Line-local failures**: a bad line is skipped, never the whole file
//! - **Lease-based coordination**: workers race for leases; a stale lease is
//!   reclaimed and its in-flight lines are handed back
//! - **Append-only records**: decoded records are written once by the lease owner
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tddf_pipeline::{Pipeline, PipelineConfig, SchedulerControl, Worker};
//!
//! let pipeline = Arc::new(Pipeline::new(PipelineConfig::default()));
//! let bytes = std::fs::read("settlement.tddf").unwrap();
//! let id = pipeline.submit_artifact(&bytes, "settlement.tddf", "production").unwrap();
//!
//! Worker::new(pipeline.clone()).drain(&SchedulerControl::new()).unwrap();
//! for batch in pipeline.get_batch_relationships(id).unwrap() {
//!     println!("{:?} {}", batch.merchant_account, batch.detail_amount_total);
//! }
//! ```

pub mod amount;
pub mod artifact;
pub mod backlog;
pub mod clock;
pub mod codec;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod lease;
pub mod phase;
pub mod pipeline;
pub mod resolver;
pub mod scheduler;
pub mod store;

pub use amount::Amount;
pub use artifact::{ArtifactId, DecodedRecord, LineId, LineStatus, RawLine, RecordId, UploadArtifact};
pub use backlog::{BacklogProcessor, BatchOutcome, RequeueCriteria};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode, detect_tag, encode_fields, DecodedLine, FieldValue, RecordType};
pub use config::PipelineConfig;
pub use duplicates::{CleanupReport, DuplicateDetector, DuplicateGroup, DuplicateKind, DuplicateScope};
pub use error::{DecodeError, PipelineError, Result};
pub use lease::{LeaseCoordinator, ProcessingLock, ResourceKey};
pub use phase::{Phase, PhaseTransition, ReleaseTarget, Trigger};
pub use pipeline::{LineSummary, Pipeline};
pub use resolver::{BatchRelationship, DetailLink};
pub use scheduler::{CycleOutcome, Scheduler, SchedulerControl, Worker};
pub use store::{Page, RecordQuery};
