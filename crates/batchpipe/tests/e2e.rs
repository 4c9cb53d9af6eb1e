//! End-to-end: a worker pool draining a batch through a scripted inference client.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use batchpipe::queue::{JobStatus, QueueSet};
use batchpipe::worker::EMPTY_OCR_ERROR;
use common::{JobBuilder, ScriptedClient, TestHarness};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_embed_jobs_four_workers() {
    let harness = TestHarness::new();
    let jobs: Vec<_> = (0..100)
        .map(|i| JobBuilder::embed(&format!("chunk {}", i)).space("S").priority(5).build())
        .collect();
    let ids = harness.queue.enqueue_batch(jobs).unwrap();

    let client = Arc::new(ScriptedClient::new().with_delay(Duration::from_millis(5)));
    let running = harness.pool(client.clone(), 4, 10).start().await;
    let handle = running.handle();

    let queue = harness.queue.clone();
    let drained = harness
        .wait_for(Duration::from_secs(30), || {
            let p = queue.get_progress("S").unwrap();
            p.completed + p.failed == 100
        })
        .await;
    handle.shutdown();
    let processed = running.wait().await.unwrap();

    assert!(drained, "batch did not drain");
    assert_eq!(processed, 100);
    assert!(client.peak_in_flight() <= 4 * 10);

    let progress = harness.queue.get_progress("S").unwrap();
    assert_eq!(progress.pending, 0);
    assert_eq!(progress.processing, 0);
    assert_eq!(progress.completed, 100);
    harness.assert_partition(&ids);

    let stats = harness.queue.get_queue_stats().unwrap();
    assert_eq!(stats.total_completed, 100);
    assert!(stats.avg_processing_time >= 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failures_are_retried_to_completion() {
    let harness = TestHarness::new();
    let id = harness
        .queue
        .enqueue(JobBuilder::embed("t").max_attempts(3).build())
        .unwrap();

    let client = Arc::new(ScriptedClient::new().failing_embeds(2));
    let running = harness.pool(client.clone(), 1, 1).start().await;
    let handle = running.handle();

    let queue = harness.queue.clone();
    let done = harness
        .wait_for(Duration::from_secs(10), || {
            queue.membership(&id).unwrap() == Some(QueueSet::Completed)
        })
        .await;
    handle.shutdown();
    running.wait().await.unwrap();

    assert!(done);
    let job = harness.queue.get_job(&id).unwrap();
    assert_eq!(job.attempts, 3);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(client.embed_calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.queue.get_queue_stats().unwrap().total_retries, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_pipeline_results() {
    let harness = TestHarness::new();
    let empty = harness.queue.enqueue(JobBuilder::full("aW1n").build()).unwrap();

    let client = Arc::new(ScriptedClient::new().with_dimensions(16));
    client.push_generate(Ok(String::new()));
    // Consumed by the first job, which then short-circuits.
    let running = harness.pool(client.clone(), 1, 1).start().await;
    let handle = running.handle();

    let queue = harness.queue.clone();
    harness
        .wait_for(Duration::from_secs(10), || {
            queue.membership(&empty).unwrap() == Some(QueueSet::Completed)
        })
        .await;
    let empty_result = harness.queue.get_job(&empty).unwrap().output_data.unwrap();
    assert_eq!(empty_result["error"], EMPTY_OCR_ERROR);

    let full = harness.queue.enqueue(JobBuilder::full("aW1n").build()).unwrap();
    harness
        .wait_for(Duration::from_secs(10), || {
            queue.membership(&full).unwrap() == Some(QueueSet::Completed)
        })
        .await;
    handle.shutdown();
    running.wait().await.unwrap();

    let result = harness.queue.get_job(&full).unwrap().output_data.unwrap();
    assert_eq!(result["embedding_dims"], 16);
    assert_eq!(result["extracted"]["product_name"], "Drill");
    // Device 1 has the most free memory.
    assert_eq!(result["gpu_id"], 1);
    assert!(client.devices_seen().iter().all(|d| *d == Some(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_lease_is_reaped_and_retried() {
    let harness = TestHarness::with_settings(batchpipe::QueueSettings {
        backoff_base: Duration::ZERO,
        max_backoff: Duration::ZERO,
        lease_ttl: Duration::from_millis(50),
        ..batchpipe::QueueSettings::default()
    });
    let id = harness.queue.enqueue(JobBuilder::embed("t").build()).unwrap();

    // A worker that claimed the job and vanished.
    harness.queue.dequeue("crashed-worker", 1).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let running = harness
        .pool(Arc::new(ScriptedClient::new()), 1, 1)
        .start()
        .await;
    let handle = running.handle();
    let queue = harness.queue.clone();
    let done = harness
        .wait_for(Duration::from_secs(10), || {
            queue.membership(&id).unwrap() == Some(QueueSet::Completed)
        })
        .await;
    handle.shutdown();
    running.wait().await.unwrap();

    assert!(done);
    let job = harness.queue.get_job(&id).unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(harness.queue.get_queue_stats().unwrap().total_reaped, 1);
}
