//! Channel plumbing shared by worker-backed queues.
//!
//! The caller side pushes into a bounded channel (never blocking; a full
//! channel is the stall signal) and the backend worker drains it.  The
//! overwritable buffer keeps at most one pending payload per tag; the
//! worker flushes entries once they have buffered long enough.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

pub(crate) const QUEUE_CAPACITY: usize = 1024;
const DEFAULT_BUFFERING: Duration = Duration::from_secs(1);

pub(crate) struct QueuedEvent {
    pub key: Option<String>,
    pub payload: String,
}

pub(crate) struct QueueCore {
    pub queue_name: String,
    pub endpoint: String,
    tx: mpsc::Sender<QueuedEvent>,
    rx: Mutex<Option<mpsc::Receiver<QueuedEvent>>>,
    overwritable: Mutex<HashMap<String, (String, Instant)>>,
    buffering_us: AtomicU64,
    connected: AtomicBool,
    sent_events: AtomicU64,
    send_time_us: AtomicU64,
}

impl QueueCore {
    pub fn new(queue_name: String, endpoint: String) -> QueueCore {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        QueueCore {
            queue_name,
            endpoint,
            tx,
            rx: Mutex::new(Some(rx)),
            overwritable: Mutex::new(HashMap::new()),
            buffering_us: AtomicU64::new(DEFAULT_BUFFERING.as_micros() as u64),
            connected: AtomicBool::new(false),
            sent_events: AtomicU64::new(0),
            send_time_us: AtomicU64::new(0),
        }
    }

    /// The receiver, exactly once; `start` calling twice is an error.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<QueuedEvent>> {
        self.rx.lock().expect("queue receiver lock poisoned").take()
    }

    /// Non-blocking hand-off to the worker.
    pub fn push(&self, key: Option<&str>, payload: String) -> bool {
        self.tx
            .try_send(QueuedEvent {
                key: key.map(str::to_owned),
                payload,
            })
            .is_ok()
    }

    pub fn is_stalled(&self) -> bool {
        !self.connected.load(Ordering::Relaxed) || self.tx.capacity() == 0
    }

    /// 0 while disconnected, else the free share of the channel.
    pub fn health(&self) -> i64 {
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        ((self.tx.capacity() * 100) / self.tx.max_capacity()) as i64
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_buffering(&self, delay: Duration) {
        self.buffering_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn buffering(&self) -> Duration {
        Duration::from_micros(self.buffering_us.load(Ordering::Relaxed))
    }

    pub fn account_send(&self, elapsed: Duration) {
        self.sent_events.fetch_add(1, Ordering::Relaxed);
        self.send_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn total_sent_events(&self) -> u64 {
        self.sent_events.load(Ordering::Relaxed)
    }

    pub fn total_send_time(&self) -> u64 {
        self.send_time_us.load(Ordering::Relaxed)
    }

    /// Insert or replace the pending payload for `tag`.
    pub fn buffer_overwritable(&self, tag: &str, payload: String) {
        self.overwritable
            .lock()
            .expect("overwritable lock poisoned")
            .insert(tag.to_owned(), (payload, Instant::now()));
    }

    /// Remove and return the pending payload for `tag`, if any.
    pub fn take_overwritable(&self, tag: &str) -> Option<String> {
        self.overwritable
            .lock()
            .expect("overwritable lock poisoned")
            .remove(tag)
            .map(|(payload, _)| payload)
    }

    /// Remove every pending payload that has buffered at least as long as
    /// the buffering delay (everything, when `force`).
    pub fn take_due_overwritable(&self, force: bool) -> Vec<String> {
        let delay = self.buffering();
        let mut map = self
            .overwritable
            .lock()
            .expect("overwritable lock poisoned");
        let due: Vec<String> = map
            .iter()
            .filter(|(_, (_, since))| force || since.elapsed() >= delay)
            .map(|(tag, _)| tag.clone())
            .collect();
        due.into_iter()
            .filter_map(|tag| map.remove(&tag).map(|(payload, _)| payload))
            .collect()
    }
}
