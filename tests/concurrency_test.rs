//! Concurrency scenarios: competing claims, many workers, stale owners.

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tddf_pipeline::codec::layout;
use tddf_pipeline::{
    encode_fields, Amount, ArtifactId, FieldValue, LineStatus, ManualClock, Page, Phase, Pipeline,
    PipelineConfig, PipelineError, RecordQuery, RecordType, ResourceKey, SchedulerControl, Worker,
};

fn file(merchant: &str, details: usize) -> String {
    let mut lines = vec![encode_fields(
        RecordType::BatchHeader,
        &[(layout::MERCHANT_ACCOUNT, FieldValue::Text(merchant.to_string()))],
    )];
    for n in 0..details {
        lines.push(encode_fields(
            RecordType::DetailTransaction,
            &[
                (layout::MERCHANT_ACCOUNT, FieldValue::Text(merchant.to_string())),
                (layout::REFERENCE_NUMBER, FieldValue::Text(format!("{}-{}", merchant, n))),
                (
                    layout::TRANSACTION_AMOUNT,
                    FieldValue::Amount(Amount::from_minor_units(n as i64 + 1)),
                ),
            ],
        ));
    }
    lines.join("\n")
}

fn pipeline(batch_size: usize) -> (Arc<ManualClock>, Arc<Pipeline>) {
    let clock = Arc::new(ManualClock::default());
    let config = PipelineConfig {
        batch_size,
        ..Default::default()
    };
    (clock.clone(), Arc::new(Pipeline::with_clock(config, clock)))
}

#[test]
fn test_simultaneous_claims_have_one_winner() {
    for _ in 0..20 {
        let (_, p) = pipeline(10);
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let key = ResourceKey::from(ArtifactId(1));

        let handles: Vec<_> = (0..contenders)
            .map(|n| {
                let p = p.clone();
                let barrier = barrier.clone();
                let key = key.clone();
                thread::spawn(move || {
                    barrier.wait();
                    p.leases()
                        .claim(&key, &format!("worker-{}", n), p.config().lease_ms)
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(p.get_lock_status().unwrap().len(), 1);
    }
}

#[test]
fn test_many_workers_process_every_line_exactly_once() {
    let (_, p) = pipeline(7);
    let ids: Vec<ArtifactId> = (0..6)
        .map(|n| {
            let body = file(&format!("M{}", n), 40 + n * 3);
            p.submit_artifact(body.as_bytes(), &format!("{}.tddf", n), "test")
                .unwrap()
        })
        .collect();

    let control = Arc::new(SchedulerControl::new());
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let worker = Worker::with_id(p.clone(), format!("worker-{}", n));
            let control = control.clone();
            thread::spawn(move || worker.drain(&control).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    // a worker may go idle while another still holds the last artifact
    Worker::with_id(p.clone(), "sweeper").drain(&control).unwrap();

    let mut seen = BTreeSet::new();
    for id in ids {
        let artifact = p.artifact(id).unwrap();
        assert_eq!(artifact.phase, Phase::Encoded, "{}", id);

        let records = p
            .get_decoded_records(&RecordQuery::artifact(id), Page::first(10_000))
            .unwrap();
        assert_eq!(records.len(), artifact.line_count);
        let lines: BTreeSet<u32> = records.iter().map(|r| r.line_number).collect();
        assert_eq!(lines.len(), artifact.line_count);
        for record in records {
            assert!(seen.insert(record.id), "record {} stored twice", record.id);
        }
        assert!(p
            .raw_lines(id)
            .unwrap()
            .iter()
            .all(|l| l.status == LineStatus::Processed));
    }
    assert!(p.get_lock_status().unwrap().is_empty());
}

#[test]
fn test_stale_owner_cannot_write_after_takeover() {
    let (clock, p) = pipeline(5);
    let id = p.submit_artifact(file("M1", 9).as_bytes(), "a.tddf", "test").unwrap();
    let key = ResourceKey::from(id);
    let lease = p.config().lease_ms;

    assert!(p.leases().claim(&key, "slow", lease).unwrap());
    let first = p.process_pending_batch("slow", Some(id)).unwrap();
    assert_eq!(first.processed, 5);

    clock.advance_ms(lease);
    assert!(p.leases().claim(&key, "fast", lease).unwrap());

    // the old owner is refused both at claim time and at heartbeat time
    assert_eq!(p.process_pending_batch("slow", Some(id)).unwrap().total(), 0);
    assert!(matches!(
        p.leases().heartbeat(&key, "slow"),
        Err(PipelineError::LeaseLost { .. })
    ));

    let rest = p.process_pending_batch("fast", Some(id)).unwrap();
    assert_eq!(rest.processed, 5);
    let records = p
        .get_decoded_records(&RecordQuery::artifact(id), Page::first(100))
        .unwrap();
    assert_eq!(records.len(), 10);
}

#[test]
fn test_sweep_boundary_is_exact() {
    let (clock, p) = pipeline(5);
    let id = p.submit_artifact(file("M1", 1).as_bytes(), "a.tddf", "test").unwrap();
    let key = ResourceKey::from(id);
    assert!(p.leases().claim(&key, "w", 1_000).unwrap());

    clock.advance_ms(999);
    assert_eq!(p.sweep_stale(1_000).unwrap(), 0);
    clock.advance_ms(1);
    assert_eq!(p.sweep_stale(1_000).unwrap(), 1);
    assert!(p.get_lock_status().unwrap().is_empty());
    assert_eq!(p.artifact(id).unwrap().lock_owner, None);
}

#[test]
fn test_pause_blocks_new_work_across_workers() {
    let (_, p) = pipeline(10);
    let id = p.submit_artifact(file("M1", 3).as_bytes(), "a.tddf", "test").unwrap();
    let control = Arc::new(SchedulerControl::new());
    control.pause();

    let handles: Vec<_> = (0..3)
        .map(|n| {
            let worker = Worker::with_id(p.clone(), format!("w{}", n));
            let control = control.clone();
            thread::spawn(move || worker.run_cycle(&control).unwrap())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), tddf_pipeline::CycleOutcome::Paused);
    }
    assert_eq!(p.artifact(id).unwrap().phase, Phase::Queued);
}
