//! Process-wide mapping from event type to the queue handling it.
//!
//! Created lazily on first registration, reference-counted (one reference
//! per registration), torn down when the last registration is released.
//! The Prometheus exporter walks it to publish per-event-type counters.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use crate::queue::EventQueue;

struct Registry {
    map: HashMap<String, Arc<dyn EventQueue>>,
    refs: usize,
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

/// Register the queue handling `event_type`.  Re-registering a type
/// replaces the queue and still takes a reference.
pub fn register(event_type: &str, queue: Arc<dyn EventQueue>) {
    let mut slot = REGISTRY.lock().expect("event registry lock poisoned");
    match slot.as_mut() {
        None => {
            let mut map = HashMap::new();
            map.insert(event_type.to_owned(), queue);
            *slot = Some(Registry { map, refs: 1 });
        }
        Some(registry) => {
            registry.map.insert(event_type.to_owned(), queue);
            registry.refs += 1;
        }
    }
}

/// Release one registration.  The map is destroyed when the reference
/// count reaches zero.
pub fn unregister(event_type: &str) {
    let mut slot = REGISTRY.lock().expect("event registry lock poisoned");
    if let Some(registry) = slot.as_mut() {
        registry.map.remove(event_type);
        registry.refs -= 1;
        if registry.refs == 0 {
            *slot = None;
        }
    }
}

/// Live reference count; zero when the registry does not exist.
pub fn active_registrations() -> usize {
    REGISTRY
        .lock()
        .expect("event registry lock poisoned")
        .as_ref()
        .map_or(0, |r| r.refs)
}

/// Append the per-event-type counters in Prometheus text format.
pub fn to_prometheus(service_id: &str, namespace: &str, out: &mut String) {
    let snapshot: Vec<(String, Arc<dyn EventQueue>)> = {
        let slot = REGISTRY.lock().expect("event registry lock poisoned");
        match slot.as_ref() {
            None => return,
            Some(registry) => registry
                .map
                .iter()
                .map(|(k, q)| (k.clone(), q.clone()))
                .collect(),
        }
    };

    for (event_type, queue) in snapshot {
        let _ = writeln!(
            out,
            "meta_event_sent_total{{service_id=\"{service_id}\",event_type=\"{event_type}\",\
             namespace=\"{namespace}\"}} {}",
            queue.total_sent_events()
        );
        let _ = writeln!(
            out,
            "meta_event_send_time_seconds_total{{service_id=\"{service_id}\",\
             event_type=\"{event_type}\",namespace=\"{namespace}\"}} {:.6}",
            queue.total_send_time() as f64 / 1_000_000.0
        );
    }
}
