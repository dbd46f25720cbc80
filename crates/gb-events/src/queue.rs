//! The polymorphic queue capability set and the send entry points.
//!
//! Backends implement [`EventQueue`]; callers go through [`send`],
//! [`send_overwritable`] and [`flush_overwritable`], which add the
//! stalled-queue fallback on top.  `send` must never block indefinitely:
//! backends enqueue into a bounded channel or a producer buffer and report
//! `false` when that is full.

use std::time::Duration;

use crate::error::EventsError;
use crate::fallback;

/// Capability set of one event queue.
///
/// `enqueue` is the raw backend hand-off; the free functions below are
/// the public path and own the fallback behavior.  Optional capabilities
/// (overwritable sends, counters) default to "not supported".
pub trait EventQueue: Send + Sync {
    /// Short name used in logs and by the fallback sink.
    fn queue_name(&self) -> &str;

    /// Endpoint descriptor, as given to the factory.
    fn endpoint(&self) -> &str;

    /// Spawn the worker driving this queue.  Must be called from within a
    /// tokio runtime; sending before `start` fails.
    fn start(&self) -> Result<(), EventsError>;

    /// Hand one payload to the backend.  Returns whether it was accepted;
    /// the queue owns the payload after acceptance.
    fn enqueue(&self, key: Option<&str>, payload: String) -> bool;

    /// Whether the backend currently refuses or severely delays sends.
    fn is_stalled(&self) -> bool;

    /// Health indicator in `0..=100`, 100 meaning fully serviceable.
    fn health(&self) -> i64 {
        100
    }

    /// How long overwritable payloads may sit in the pending buffer.
    fn set_buffering(&self, _delay: Duration) {}

    fn supports_overwritable(&self) -> bool {
        false
    }

    /// Queue a payload that newer payloads with the same tag may replace.
    /// Only meaningful when `supports_overwritable` is true.
    fn enqueue_overwritable(&self, _tag: &str, payload: String) -> bool {
        self.enqueue(None, payload)
    }

    /// Push tagged-pending payloads out immediately.
    fn flush_overwritable(&self, _tag: &str) {}

    /// Cumulative broker hand-off time, microseconds.
    fn total_send_time(&self) -> u64 {
        0
    }

    fn total_sent_events(&self) -> u64 {
        0
    }
}

/// Send one event, best-effort.
///
/// A stalled queue with a fallback installed drops the payload to the
/// sink and reports `false`; without a fallback the backend decides (and
/// typically also reports `false`).
pub fn send(queue: &dyn EventQueue, key: Option<&str>, payload: String) -> bool {
    if fallback::installed() && queue.is_stalled() {
        fallback::drop_event(queue.queue_name(), key, &payload);
        return false;
    }
    queue.enqueue(key, payload)
}

/// Send with supersede-by-tag semantics when the backend supports them,
/// else a plain keyless send.
pub fn send_overwritable(queue: &dyn EventQueue, tag: &str, payload: String) -> bool {
    if queue.supports_overwritable() && !tag.is_empty() {
        return queue.enqueue_overwritable(tag, payload);
    }
    send(queue, None, payload)
}

/// Drain pending payloads for `tag` now.  A no-op on backends without
/// overwritable support or with an empty tag.
pub fn flush_overwritable(queue: &dyn EventQueue, tag: &str) {
    if queue.supports_overwritable() && !tag.is_empty() {
        queue.flush_overwritable(tag);
    }
}
