//! Fallback sink for events dropped while a queue is stalled.
//!
//! Installation is process-wide: the transport plane decides once whether
//! dropped events are persisted, application code just calls
//! [`crate::send`].  Without an installed sink, stalled-queue sends fail
//! without a trace beyond their `false` return.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

pub trait EventFallback: Send + Sync {
    fn drop_event(&self, queue_name: &str, key: Option<&str>, payload: &str);
}

static FALLBACK: RwLock<Option<Arc<dyn EventFallback>>> = RwLock::new(None);

pub fn install(sink: Arc<dyn EventFallback>) {
    *FALLBACK.write().expect("fallback lock poisoned") = Some(sink);
}

pub fn clear() {
    *FALLBACK.write().expect("fallback lock poisoned") = None;
}

pub fn installed() -> bool {
    FALLBACK.read().expect("fallback lock poisoned").is_some()
}

pub(crate) fn drop_event(queue_name: &str, key: Option<&str>, payload: &str) {
    let sink = FALLBACK.read().expect("fallback lock poisoned").clone();
    if let Some(sink) = sink {
        sink.drop_event(queue_name, key, payload);
    }
}

// ---------------------------------------------------------------------------
// File sink
// ---------------------------------------------------------------------------

/// Appends one JSON line per dropped event to `<dir>/<queue_name>.dropped`.
pub struct FileFallback {
    dir: PathBuf,
}

impl FileFallback {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<FileFallback> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileFallback { dir })
    }
}

impl EventFallback for FileFallback {
    fn drop_event(&self, queue_name: &str, key: Option<&str>, payload: &str) {
        let when = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let line = serde_json::json!({
            "when": when,
            "queue": queue_name,
            "key": key,
            "payload": payload,
        });
        let path = self.dir.join(format!("{queue_name}.dropped"));
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to persist dropped event");
        }
    }
}
