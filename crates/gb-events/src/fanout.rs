//! Fanout: one queue face over N sub-queues.
//!
//! Keyed sends shard by a stable hash of the key so a given key always
//! lands on the same child; keyless sends round-robin.  The stall policy
//! is all-children: one stalled endpoint only narrows the fanout, it does
//! not stop the flow.  Health is the weakest child.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::EventsError;
use crate::queue::EventQueue;

pub struct FanoutQueue {
    queue_name: String,
    endpoint: String,
    children: Vec<Box<dyn EventQueue>>,
    round_robin: AtomicUsize,
}

impl FanoutQueue {
    /// Wrap `children`; at least one is required.
    pub fn new(children: Vec<Box<dyn EventQueue>>) -> Result<FanoutQueue, EventsError> {
        if children.is_empty() {
            return Err(EventsError::EmptyConnectionString);
        }
        let endpoint = children
            .iter()
            .map(|c| c.endpoint())
            .collect::<Vec<_>>()
            .join(",");
        let queue_name = children[0].queue_name().to_owned();
        Ok(FanoutQueue {
            queue_name,
            endpoint,
            children,
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn child_for(&self, key: Option<&str>) -> &dyn EventQueue {
        let index = match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.children.len() as u64) as usize
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.children.len(),
        };
        self.children[index].as_ref()
    }
}

impl EventQueue for FanoutQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn start(&self) -> Result<(), EventsError> {
        for child in &self.children {
            child.start()?;
        }
        Ok(())
    }

    fn enqueue(&self, key: Option<&str>, payload: String) -> bool {
        self.child_for(key).enqueue(key, payload)
    }

    /// All-children policy: a transient single-endpoint stall is hidden.
    fn is_stalled(&self) -> bool {
        self.children.iter().all(|c| c.is_stalled())
    }

    fn health(&self) -> i64 {
        self.children.iter().map(|c| c.health()).min().unwrap_or(0)
    }

    fn set_buffering(&self, delay: Duration) {
        for child in &self.children {
            child.set_buffering(delay);
        }
    }

    fn supports_overwritable(&self) -> bool {
        self.children.iter().all(|c| c.supports_overwritable())
    }

    fn enqueue_overwritable(&self, tag: &str, payload: String) -> bool {
        // Route by tag so supersede-by-tag stays within one child.
        self.child_for(Some(tag)).enqueue_overwritable(tag, payload)
    }

    fn flush_overwritable(&self, tag: &str) {
        self.child_for(Some(tag)).flush_overwritable(tag);
    }

    fn total_send_time(&self) -> u64 {
        self.children.iter().map(|c| c.total_send_time()).sum()
    }

    fn total_sent_events(&self) -> u64 {
        self.children.iter().map(|c| c.total_sent_events()).sum()
    }
}
