//! End-to-end event-queue suite: fanout over live mock brokers, the
//! fallback drop sink, and overwritable sends through a fanout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gb_events::beanstalkd::BeanstalkdQueue;
use gb_events::fallback::{self, FileFallback};
use gb_events::queue::EventQueue;
use gb_events::{create_queue, flush_overwritable, send, send_overwritable};
use gb_test_utils::MockBeanstalkd;

// The fallback sink is process-wide; serialize the tests that rely on its
// presence or absence.
static FALLBACK_LOCK: Mutex<()> = Mutex::new(());

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn fanout_shards_across_brokers_and_sums_counters() {
    let _guard = FALLBACK_LOCK.lock().unwrap();
    fallback::clear();

    let broker_a = MockBeanstalkd::start().await;
    let broker_b = MockBeanstalkd::start().await;
    let conn = format!("beanstalk://{},beanstalk://{}", broker_a.addr(), broker_b.addr());
    let queue = create_queue(&conn, "notif", false).unwrap();
    queue.start().unwrap();
    wait_for("both workers connected", || !queue.is_stalled() && queue.health() == 100).await;

    let mut accepted = 0u64;
    for i in 0..20 {
        let key = format!("content-{}", i % 4);
        assert!(send(queue.as_ref(), Some(&key), format!("{{\"n\":{i}}}")));
        accepted += 1;
    }
    for i in 0..5 {
        assert!(send(queue.as_ref(), None, format!("{{\"keyless\":{i}}}")));
        accepted += 1;
    }

    wait_for("all events delivered", || {
        (broker_a.payloads().len() + broker_b.payloads().len()) as u64 == accepted
    })
    .await;
    assert_eq!(queue.total_sent_events(), accepted);
    assert!(queue.total_send_time() > 0);
    // Both shards saw traffic.
    assert!(!broker_a.payloads().is_empty());
    assert!(!broker_b.payloads().is_empty());
}

#[tokio::test]
async fn stalled_queue_drops_to_the_file_fallback() {
    let _guard = FALLBACK_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    fallback::install(Arc::new(FileFallback::new(dir.path()).unwrap()));

    // Never started: permanently stalled.
    let queue = BeanstalkdQueue::new("127.0.0.1:1", "notif");
    assert!(!send(&queue, Some("k"), "{\"event\":\"lost\"}".to_owned()));

    let dropped = std::fs::read_to_string(dir.path().join("notif.dropped")).unwrap();
    let line: serde_json::Value = serde_json::from_str(dropped.lines().next().unwrap()).unwrap();
    assert_eq!(line["key"], "k");
    assert_eq!(line["payload"], "{\"event\":\"lost\"}");

    fallback::clear();

    // Without the sink, a stalled send still fails, just without a trace.
    assert!(!send(&queue, None, "{\"event\":\"lost2\"}".to_owned()));
}

#[tokio::test]
async fn overwritable_sends_route_by_tag_through_a_fanout() {
    let _guard = FALLBACK_LOCK.lock().unwrap();
    fallback::clear();

    let broker_a = MockBeanstalkd::start().await;
    let broker_b = MockBeanstalkd::start().await;
    let conn = format!("beanstalk://{},beanstalk://{}", broker_a.addr(), broker_b.addr());
    let queue = create_queue(&conn, "notif", false).unwrap();
    assert!(queue.supports_overwritable());
    queue.set_buffering(Duration::from_secs(3600));
    queue.start().unwrap();
    wait_for("both workers connected", || !queue.is_stalled() && queue.health() == 100).await;

    assert!(send_overwritable(queue.as_ref(), "vol-state", "v1".to_owned()));
    assert!(send_overwritable(queue.as_ref(), "vol-state", "v2".to_owned()));
    assert!(send_overwritable(queue.as_ref(), "vol-state", "v3".to_owned()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        broker_a.payloads().is_empty() && broker_b.payloads().is_empty(),
        "buffered payloads must not leave before the flush"
    );

    flush_overwritable(queue.as_ref(), "vol-state");
    wait_for("flushed payload", || {
        broker_a.payloads().len() + broker_b.payloads().len() == 1
    })
    .await;
    // Only the newest payload survived, on exactly one shard.
    let mut all = broker_a.payloads();
    all.extend(broker_b.payloads());
    assert_eq!(all, ["v3"]);
}
