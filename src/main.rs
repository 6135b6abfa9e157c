//! TDDF Pipeline CLI
//!
//! Decodes one or more TDDF files and writes a batch reconciliation report
//! as CSV.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- settlement.tddf > batches.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `TDDF_*`: pipeline settings, see `PipelineConfig::from_env`

use log::warn;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process;
use std::sync::Arc;
use tddf_pipeline::{
    ArtifactId, BatchRelationship, Phase, Pipeline, PipelineConfig, PipelineError, Result,
    SchedulerControl, Worker,
};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let paths: Vec<String> = env::args().skip(1).collect();
    if paths.is_empty() {
        return Err(PipelineError::MissingArgument);
    }

    let config = PipelineConfig::from_env()?;
    let environment = config.environment.clone();
    let pipeline = Arc::new(Pipeline::new(config));

    let mut artifacts = Vec::with_capacity(paths.len());
    for path in &paths {
        let bytes = fs::read(path)?;
        let filename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        artifacts.push(pipeline.submit_artifact(&bytes, &filename, &environment)?);
    }

    Worker::new(pipeline.clone()).drain(&SchedulerControl::new())?;

    let mut batches = Vec::new();
    for id in artifacts {
        let artifact = pipeline.artifact(id)?;
        if artifact.phase != Phase::Encoded {
            warn!("{} ({}) ended in {}, not reported", id, artifact.filename, artifact.phase);
            continue;
        }
        batches.extend(pipeline.get_batch_relationships(id)?);
    }

    let stdout = io::stdout();
    let handle = stdout.lock();
    write_report(handle, &batches)
}

fn write_report<W: Write>(writer: W, batches: &[BatchRelationship]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record([
        "artifact_id",
        "batch_line",
        "merchant_account",
        "detail_count",
        "extension_count",
        "detail_amount_total",
        "declared_net_deposit",
        "variance",
    ])?;

    for batch in batches {
        let ArtifactId(artifact) = batch.artifact_id;
        csv_writer.write_record([
            artifact.to_string(),
            batch.header_line.to_string(),
            batch.merchant_account.clone().unwrap_or_default(),
            batch.detail_count().to_string(),
            batch.extension_count().to_string(),
            batch.detail_amount_total.to_string(),
            batch
                .declared_net_deposit
                .map(|d| d.to_string())
                .unwrap_or_default(),
            batch.variance.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}
