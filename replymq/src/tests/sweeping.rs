//! Orphan detection and tracking log compaction.

use std::time::Duration;

use crate::config::{ReplyQueueConfig, SweeperConfig};
use crate::reply::ReplyQueue;
use crate::sweeper::{unix_now, Sweeper, TrackingLog, TrackingRecord};
use crate::tests::{reply_config, TestCase};
use crate::transport::{QueueAddress, QueueAttributes, QueueTransport};

fn sweeper_config() -> SweeperConfig {
    SweeperConfig {
        tracking_queue: "test-tracking".to_string(),
        grace_period_seconds: 90,
        sweep_interval_seconds: 3600,
    }
}

/// A heartbeat record whose timestamp lies `age` seconds in the past.
fn aged_record(
    queue_name: &str,
    queue_address: &QueueAddress,
    heartbeat_interval: u64,
    age: u64,
) -> TrackingRecord {
    let mut record = TrackingRecord::alive(queue_name, queue_address, heartbeat_interval);
    record.last_heartbeat = unix_now() - age;

    record
}

#[tokio::test]
async fn stale_queue_is_swept() {
    let tc = TestCase::new().await;
    let stale = tc
        .transport
        .create_queue("stale-replies", QueueAttributes::new())
        .await
        .unwrap();

    let log = TrackingLog::open(tc.shared(), "test-tracking").await.unwrap();
    log.announce(aged_record("stale-replies", &stale, 30, 200))
        .await
        .unwrap();

    let sweeper = Sweeper::open(tc.shared(), sweeper_config()).await.unwrap();
    let report = sweeper.scan().await.unwrap();

    assert_eq!(report.removed, vec!["stale-replies".to_string()]);
    assert!(tc.transport.get_queue("stale-replies").await.unwrap().is_none());

    // Nothing left on the log either.
    assert!(log.drain().await.unwrap().is_empty());
}

#[tokio::test]
async fn fresh_queue_survives_and_its_records_compact() {
    let tc = TestCase::new().await;
    let fresh = tc
        .transport
        .create_queue("fresh-replies", QueueAttributes::new())
        .await
        .unwrap();

    let log = TrackingLog::open(tc.shared(), "test-tracking").await.unwrap();
    for age in [60, 40, 20] {
        log.announce(aged_record("fresh-replies", &fresh, 30, age))
            .await
            .unwrap();
    }

    let sweeper = Sweeper::open(tc.shared(), sweeper_config()).await.unwrap();
    let report = sweeper.scan().await.unwrap();

    assert!(report.removed.is_empty());
    assert_eq!(report.live, 1);
    assert!(tc.transport.get_queue("fresh-replies").await.unwrap().is_some());

    // Three drained announcements were folded into a single fresh one.
    let drained = log.drain().await.unwrap();
    assert_eq!(drained.len(), 1);
    assert!(drained[0].0.last_heartbeat >= unix_now() - 25);
}

#[tokio::test]
async fn announced_interval_overrides_a_short_grace() {
    let tc = TestCase::new().await;
    let slow = tc
        .transport
        .create_queue("slow-but-alive", QueueAttributes::new())
        .await
        .unwrap();
    let fast = tc
        .transport
        .create_queue("fast-and-dead", QueueAttributes::new())
        .await
        .unwrap();

    let log = TrackingLog::open(tc.shared(), "test-tracking").await.unwrap();
    // Both are ten seconds old, but the slow producer promised a sixty
    // second heartbeat and gets two intervals of grace.
    log.announce(aged_record("slow-but-alive", &slow, 60, 10))
        .await
        .unwrap();
    log.announce(aged_record("fast-and-dead", &fast, 1, 10))
        .await
        .unwrap();

    let config = SweeperConfig {
        grace_period_seconds: 1,
        ..sweeper_config()
    };
    let sweeper = Sweeper::open(tc.shared(), config).await.unwrap();
    let report = sweeper.scan().await.unwrap();

    assert_eq!(report.removed, vec!["fast-and-dead".to_string()]);
    assert_eq!(report.live, 1);
    assert!(tc.transport.get_queue("slow-but-alive").await.unwrap().is_some());
}

#[tokio::test]
async fn tombstone_wins_over_stale_heartbeats() {
    let tc = TestCase::new().await;

    // The queue itself is long gone, only log entries remain.
    let address = QueueAddress::new("memory://gone-replies");
    let log = TrackingLog::open(tc.shared(), "test-tracking").await.unwrap();
    log.announce(aged_record("gone-replies", &address, 30, 200))
        .await
        .unwrap();
    log.retire("gone-replies").await.unwrap();

    let sweeper = Sweeper::open(tc.shared(), sweeper_config()).await.unwrap();
    let report = sweeper.scan().await.unwrap();

    assert!(report.removed.is_empty());
    assert_eq!(report.retired, 1);
    assert!(log.drain().await.unwrap().is_empty());
}

#[tokio::test]
async fn crashed_producer_is_cleaned_up_eventually() {
    let tc = TestCase::new().await;

    let config = ReplyQueueConfig {
        heartbeat_interval_seconds: 1,
        ..reply_config()
    };
    // Created but never started, the producer crashed before its first
    // heartbeat.
    let reply_queue = ReplyQueue::create(tc.shared(), config).await.unwrap();
    let name = reply_queue.name().to_string();

    let sweeper_config = SweeperConfig {
        grace_period_seconds: 1,
        ..sweeper_config()
    };
    let sweeper = Sweeper::open(tc.shared(), sweeper_config).await.unwrap();

    // Still within grace, the queue is left alone.
    let early = sweeper.scan().await.unwrap();
    assert!(early.removed.is_empty());
    assert!(tc.transport.get_queue(&name).await.unwrap().is_some());

    // Comfortably past two announced intervals, even with whole-second
    // heartbeat timestamps.
    tokio::time::sleep(Duration::from_millis(3200)).await;

    let late = sweeper.scan().await.unwrap();
    assert_eq!(late.removed, vec![name.clone()]);
    assert!(tc.transport.get_queue(&name).await.unwrap().is_none());
}

#[tokio::test]
async fn cleanly_removed_queue_leaves_no_trace() {
    let tc = TestCase::new().await;
    let reply_queue = tc.reply_queue().await;
    reply_queue.start();
    reply_queue.remove_queue().await.unwrap();

    let sweeper = Sweeper::open(tc.shared(), sweeper_config()).await.unwrap();

    let first = sweeper.scan().await.unwrap();
    assert!(first.removed.is_empty());
    assert_eq!(first.retired, 1);

    let second = sweeper.scan().await.unwrap();
    assert!(second.removed.is_empty());
    assert_eq!(second.retired, 0);
    assert_eq!(second.live, 0);
}

#[tokio::test]
async fn sweeper_task_starts_and_stops() {
    let tc = TestCase::new().await;
    let sweeper = Sweeper::open(tc.shared(), sweeper_config()).await.unwrap();

    let handle = sweeper.start();
    handle.stop().await;
}
