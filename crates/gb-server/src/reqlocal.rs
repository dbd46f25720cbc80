//! Ambient per-request record.
//!
//! Installed as a task-local scope around handler invocation, so the
//! handler and everything it calls can read the deadline and the request
//! id, and attach timing samples, without threading a context argument
//! through every signature.  Outside a request scope the accessors
//! degrade to `None`/no-op.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

tokio::task_local! {
    static REQUEST: RefCell<RequestScope>;
}

pub struct RequestScope {
    reqid: String,
    deadline: Instant,
    perfdata: Option<BTreeMap<String, Duration>>,
    db_wait: Duration,
}

impl RequestScope {
    pub fn new(reqid: String, deadline: Instant, perfdata_enabled: bool) -> RequestScope {
        RequestScope {
            reqid,
            deadline,
            perfdata: perfdata_enabled.then(BTreeMap::new),
            db_wait: Duration::ZERO,
        }
    }
}

/// Run `fut` inside a request scope.
pub async fn with_scope<F>(scope: RequestScope, fut: F) -> F::Output
where
    F: Future,
{
    REQUEST.scope(RefCell::new(scope), fut).await
}

/// The ambient deadline, when inside a request scope.
pub fn deadline() -> Option<Instant> {
    REQUEST.try_with(|r| r.borrow().deadline).ok()
}

/// Tighten the ambient deadline.  Attempts to extend it are ignored.
pub fn tighten_deadline(new: Instant) {
    let _ = REQUEST.try_with(|r| {
        let mut r = r.borrow_mut();
        if new < r.deadline {
            r.deadline = new;
        }
    });
}

pub fn reqid() -> Option<String> {
    REQUEST.try_with(|r| r.borrow().reqid.clone()).ok()
}

/// Record one named phase duration.  No-op when perfdata is disabled for
/// this request, or outside a request scope.
pub fn add_perfdata(name: &str, elapsed: Duration) {
    let _ = REQUEST.try_with(|r| {
        if let Some(perfdata) = r.borrow_mut().perfdata.as_mut() {
            *perfdata.entry(name.to_owned()).or_insert(Duration::ZERO) += elapsed;
        }
    });
}

pub fn perfdata_snapshot() -> Option<BTreeMap<String, Duration>> {
    REQUEST
        .try_with(|r| r.borrow().perfdata.clone())
        .ok()
        .flatten()
}

/// Account time spent waiting on a downstream database or service.
pub fn add_db_wait(elapsed: Duration) {
    let _ = REQUEST.try_with(|r| r.borrow_mut().db_wait += elapsed);
}

pub fn db_wait() -> Duration {
    REQUEST
        .try_with(|r| r.borrow().db_wait)
        .unwrap_or(Duration::ZERO)
}

/// Deadline from arrival time, server cap and optional client override.
///
/// A positive TIMEOUT field tightens the deadline, never extends it.
pub fn compute_deadline(arrival: Instant, max_run_time: Duration, timeout_ms: Option<i64>) -> Instant {
    let initial = arrival + max_run_time;
    match timeout_ms {
        Some(ms) if ms > 0 => match arrival.checked_add(Duration::from_millis(ms as u64)) {
            Some(client) => initial.min(client),
            None => initial,
        },
        _ => initial,
    }
}
