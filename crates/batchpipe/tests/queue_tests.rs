//! Queue ordering, retry and accounting properties against an on-disk store.

mod common;

use std::collections::HashSet;
use std::thread;

use serde_json::json;

use batchpipe::queue::{FailOutcome, JobStatus, QueueSet};
use common::{JobBuilder, TestHarness};

#[test]
fn test_priority_ordering() {
    let harness = TestHarness::new();
    for (id, priority) in [("p5", 5), ("p10", 10), ("p1", 1)] {
        harness
            .queue
            .enqueue(JobBuilder::embed("t").id(id).priority(priority).build())
            .unwrap();
    }

    let order: Vec<String> = (0..3)
        .map(|_| harness.queue.dequeue("w", 1).unwrap().remove(0).id)
        .collect();
    assert_eq!(order, vec!["p10", "p5", "p1"]);
    assert!(harness.queue.dequeue("w", 1).unwrap().is_empty());
}

#[test]
fn test_fifo_within_equal_priority() {
    let harness = TestHarness::new();
    harness.queue.enqueue(JobBuilder::embed("t").id("first").build()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    harness.queue.enqueue(JobBuilder::embed("t").id("second").build()).unwrap();

    let claimed = harness.queue.dequeue("w", 2).unwrap();
    let ids: Vec<&str> = claimed.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);
}

#[test]
fn test_retry_terminates_after_max_attempts() {
    let harness = TestHarness::new();
    let id = harness
        .queue
        .enqueue(JobBuilder::embed("t").max_attempts(3).build())
        .unwrap();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let job = harness.queue.dequeue("w", 1).unwrap().remove(0);
        assert_eq!(job.id, id);
        statuses.push(harness.queue.get_job(&id).unwrap().status);
        harness.queue.fail(&id, "boom", true).unwrap();
        statuses.push(harness.queue.get_job(&id).unwrap().status);
    }

    assert_eq!(
        statuses,
        vec![
            JobStatus::Processing,
            JobStatus::Retrying,
            JobStatus::Processing,
            JobStatus::Retrying,
            JobStatus::Processing,
            JobStatus::Failed,
        ]
    );
    assert!(harness.queue.dequeue("w", 1).unwrap().is_empty());
    assert_eq!(harness.queue.membership(&id).unwrap(), Some(QueueSet::Failed));

    let stats = harness.queue.get_queue_stats().unwrap();
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(harness.queue.get_progress("space-1").unwrap().failed, 1);
}

#[test]
fn test_fail_without_retry_is_terminal() {
    let harness = TestHarness::new();
    let id = harness.queue.enqueue(JobBuilder::embed("t").build()).unwrap();
    harness.queue.dequeue("w", 1).unwrap();

    assert_eq!(harness.queue.fail(&id, "bad input", false).unwrap(), FailOutcome::Failed);
    assert_eq!(harness.queue.get_job(&id).unwrap().attempts, 1);
}

#[test]
fn test_complete_is_idempotent() {
    let harness = TestHarness::new();
    let id = harness.queue.enqueue(JobBuilder::embed("t").build()).unwrap();
    harness.queue.dequeue("w", 1).unwrap();

    assert!(harness.queue.complete(&id, json!({ "ok": true })).unwrap());
    assert!(!harness.queue.complete(&id, json!({ "ok": false })).unwrap());

    let stats = harness.queue.get_queue_stats().unwrap();
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(harness.queue.get_job(&id).unwrap().output_data, Some(json!({ "ok": true })));
    assert_eq!(harness.queue.get_progress("space-1").unwrap().completed, 1);
}

#[test]
fn test_progress_conservation() {
    let harness = TestHarness::new();
    let n = 10;
    let jobs: Vec<_> = (0..n).map(|_| JobBuilder::embed("t").space("S").build()).collect();
    let ids = harness.queue.enqueue_batch(jobs).unwrap();
    harness.assert_partition(&ids);

    let mut outcomes = 0;
    while let Some(job) = harness.queue.dequeue("w", 1).unwrap().pop() {
        if outcomes % 3 == 0 {
            harness.queue.fail(&job.id, "nope", false).unwrap();
        } else {
            harness.queue.complete(&job.id, json!({})).unwrap();
        }
        outcomes += 1;
        harness.assert_partition(&ids);

        let p = harness.queue.get_progress("S").unwrap();
        assert!(p.completed + p.failed <= n);
        assert_eq!(p.pending + p.processing + p.completed + p.failed, n);
    }

    let p = harness.queue.get_progress("S").unwrap();
    assert_eq!(p.total, n);
    assert_eq!(p.completed + p.failed, n);
    assert_eq!(p.pending, 0);
}

#[test]
fn test_concurrent_claims_are_disjoint() {
    let harness = TestHarness::new();
    let jobs: Vec<_> = (0..60).map(|_| JobBuilder::embed("t").build()).collect();
    harness.queue.enqueue_batch(jobs).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let queue = harness.open_another();
            thread::spawn(move || {
                let worker = format!("w{}", i);
                let mut claimed = Vec::new();
                loop {
                    let batch = queue.dequeue(&worker, 3).unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|j| j.id));
                }
                claimed
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(id), "job claimed twice");
        }
    }
    assert_eq!(total, 60);
    assert_eq!(harness.queue.get_queue_stats().unwrap().processing, 60);
}

#[test]
fn test_submit_and_cancel_batch() {
    let harness = TestHarness::new();
    let request = batchpipe::BatchRequest::new(
        "S",
        vec!["a.png".into(), "b.png".into(), "c.png".into()],
        batchpipe::JobType::Full,
    );
    let receipt = harness.queue.submit_batch(&request).unwrap();
    assert_eq!(receipt.job_ids.len(), 3);

    let claimed = harness.queue.dequeue("w", 1).unwrap().remove(0);
    harness.queue.complete(&claimed.id, json!({})).unwrap();
    let in_flight = harness.queue.dequeue("w", 1).unwrap().remove(0);

    let cancellation = harness.queue.cancel_batch(&receipt.batch_id).unwrap();
    assert_eq!(cancellation.cancelled, 1);
    assert_eq!(cancellation.requested, 1);
    assert_eq!(cancellation.already_finished, 1);

    assert!(harness.queue.is_cancel_requested(&in_flight.id).unwrap());
    assert!(harness.queue.acknowledge_cancel(&in_flight.id).unwrap());

    let p = harness.queue.get_progress("S").unwrap();
    assert_eq!(p.batch_id.as_deref(), Some(receipt.batch_id.as_str()));
    assert_eq!((p.completed, p.cancelled, p.pending, p.processing), (1, 2, 0, 0));
}
