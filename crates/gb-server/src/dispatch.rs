//! Request dispatch: name → handler, plus the I/O-health gate.
//!
//! The handler map is filled before `bind_host` and treated as immutable
//! afterwards; dispatch only reads it.  Handlers registered with
//! [`HandlerScope::LocalLowLevel`] answer even while the node reports I/O
//! errors, so probes like PING keep working on a degraded node.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use gb_proto::status;

use crate::reply::ReplyContext;
use crate::stats::{self, StatsTable};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// One registered request handler.
///
/// The returned boolean is the transport verdict: `false` asks the server
/// to drop the connection after the reply (the handler saw something it
/// does not trust the stream after).
pub trait RequestHandler: Send + Sync {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a>;
}

/// Marker replacing pointer-identity sentinels: local low-level handlers
/// bypass the I/O-health gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    Normal,
    LocalLowLevel,
}

pub struct RequestDescriptor {
    pub name: &'static str,
    pub scope: HandlerScope,
    pub handler: Box<dyn RequestHandler>,
}

impl RequestDescriptor {
    pub fn new(
        name: &'static str,
        scope: HandlerScope,
        handler: impl RequestHandler + 'static,
    ) -> RequestDescriptor {
        RequestDescriptor {
            name,
            scope,
            handler: Box::new(handler),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("overriding another request with '{0}'")]
    DuplicateName(String),
}

struct HandlerRecord {
    handler: Box<dyn RequestHandler>,
    scope: HandlerScope,
    stat_hits: String,
    stat_time: String,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    handlers: BTreeMap<String, HandlerRecord>,
    io: IoHealth,
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

impl Dispatcher {
    /// An empty dispatcher already answering the built-in admin requests.
    pub fn new() -> Dispatcher {
        let mut disp = Dispatcher {
            handlers: BTreeMap::new(),
            io: IoHealth::new(),
        };
        disp.register(crate::admin::common_requests())
            .expect("built-in handler names collide");
        disp
    }

    /// Register application handlers.  Duplicate names are a configuration
    /// error, including collisions with the built-ins.
    pub fn register(
        &mut self,
        descriptors: Vec<RequestDescriptor>,
    ) -> Result<(), DispatchError> {
        for descr in descriptors {
            if self.handlers.contains_key(descr.name) {
                return Err(DispatchError::DuplicateName(descr.name.to_owned()));
            }
            self.handlers.insert(
                descr.name.to_owned(),
                HandlerRecord {
                    handler: descr.handler,
                    scope: descr.scope,
                    stat_hits: stats::key_hits(descr.name),
                    stat_time: stats::key_time(descr.name),
                },
            );
        }
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Zero every per-handler counter so never-hit handlers show up in
    /// STATS output instead of being absent.
    pub fn seed_stats(&self, stats: &StatsTable) {
        for record in self.handlers.values() {
            stats.set(&record.stat_hits, 0);
            stats.set(&record.stat_time, 0);
        }
        stats.set(stats::KEY_HITS_ALL, 0);
        stats.set(stats::KEY_TIME_ALL, 0);
        stats.set(&stats::key_hits(stats::METHOD_UNEXPECTED), 0);
        stats.set(&stats::key_time(stats::METHOD_UNEXPECTED), 0);
    }

    /// Route one decoded request.  Exactly one of the fixed replies or the
    /// handler runs; counters are updated either way.
    pub async fn dispatch(&self, reply: &mut ReplyContext) -> bool {
        let server = reply.server().clone();
        let stats = &server.stats;
        let queued = reply.parsed().saturating_duration_since(reply.arrival());
        let max_delay = server.vars.queue_max_delay();

        if max_delay > Duration::ZERO && queued > max_delay {
            // Not worth running the handler: the caller most likely gave up.
            let msg = format!("Queued for too long ({}ms)", queued.as_millis());
            reply.send_reply(status::CODE_GATEWAY_TIMEOUT, &msg);
            account(
                stats,
                &stats::key_hits(stats::METHOD_OVERLOADED),
                &stats::key_time(stats::METHOD_OVERLOADED),
                reply.arrival(),
            );
            return true;
        }

        let Some(record) = self.handlers.get(reply.req_name()) else {
            reply.send_reply(status::CODE_NOT_FOUND, "No handler found");
            account(
                stats,
                &stats::key_hits(stats::METHOD_UNEXPECTED),
                &stats::key_time(stats::METHOD_UNEXPECTED),
                reply.arrival(),
            );
            return true;
        };

        if record.scope != HandlerScope::LocalLowLevel && !self.io.is_ok() {
            let msg = format!("IO errors reported: {}", self.io.last_message());
            reply.send_reply(status::CODE_UNAVAILABLE, &msg);
            account(
                stats,
                &stats::key_hits(stats::METHOD_IOERROR),
                &stats::key_time(stats::METHOD_IOERROR),
                reply.arrival(),
            );
            return true;
        }

        let rc = record.handler.handle(reply).await;
        account(stats, &record.stat_hits, &record.stat_time, reply.arrival());
        rc
    }

    /// Feed the I/O probe result into the health flag.
    pub fn notify_io_status(&self, ok: bool, message: &str) {
        self.io.notify(ok, message);
    }

    pub fn is_io_ok(&self) -> bool {
        self.io.is_ok()
    }

    pub fn last_io_message(&self) -> String {
        self.io.last_message()
    }
}

fn account(stats: &StatsTable, hits_key: &str, time_key: &str, arrival: Instant) {
    let elapsed_us = arrival.elapsed().as_micros() as u64;
    stats.add(hits_key, 1);
    stats.add(stats::KEY_HITS_ALL, 1);
    stats.add(time_key, elapsed_us);
    stats.add(stats::KEY_TIME_ALL, elapsed_us);
}

// ---------------------------------------------------------------------------
// I/O health
// ---------------------------------------------------------------------------

const IO_STALE_AFTER: Duration = Duration::from_secs(60);
const IO_REPORT_EVERY: Duration = Duration::from_secs(60);

/// Rolling I/O-health flag fed by an external probe.
///
/// Timestamps are microseconds since construction, stored relaxed: a torn
/// or stale read only delays a policy change by one observation.
struct IoHealth {
    epoch: Instant,
    last_success_us: AtomicU64,
    last_error_us: AtomicU64,
    last_report_us: AtomicU64,
    message: RwLock<String>,
}

impl IoHealth {
    fn new() -> IoHealth {
        IoHealth {
            epoch: Instant::now(),
            last_success_us: AtomicU64::new(0),
            last_error_us: AtomicU64::new(0),
            last_report_us: AtomicU64::new(0),
            message: RwLock::new(String::new()),
        }
    }

    /// Microseconds since construction, never zero (zero means "never").
    fn now_us(&self) -> u64 {
        (self.epoch.elapsed().as_micros() as u64).max(1)
    }

    fn notify(&self, ok: bool, message: &str) {
        let now = self.now_us();
        if ok {
            self.last_success_us.store(now, Ordering::Relaxed);
        } else {
            self.last_error_us.store(now, Ordering::Relaxed);
        }
        let mut slot = self.message.write().expect("io message lock poisoned");
        slot.clear();
        slot.push_str(if message.is_empty() { "n/a" } else { message });
    }

    fn is_ok(&self) -> bool {
        let success = self.last_success_us.load(Ordering::Relaxed);
        let error = self.last_error_us.load(Ordering::Relaxed);

        if success == 0 && error == 0 {
            return true;
        }
        if error > success {
            return false;
        }

        let now = self.now_us();
        let stale_floor = now.saturating_sub(IO_STALE_AFTER.as_micros() as u64);
        let ok = success > stale_floor;
        if !ok {
            // The probe itself looks stuck; complain at most once a minute.
            let last_report = self.last_report_us.load(Ordering::Relaxed);
            if now.saturating_sub(last_report) > IO_REPORT_EVERY.as_micros() as u64
                && self
                    .last_report_us
                    .compare_exchange(last_report, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                warn!(
                    minutes = (now - success) / 60_000_000,
                    "IO error checker stalled"
                );
            }
        }
        ok
    }

    fn last_message(&self) -> String {
        self.message.read().expect("io message lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        struct Nop;
        impl RequestHandler for Nop {
            fn handle<'a>(&'a self, _reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
                Box::pin(async { true })
            }
        }

        let mut disp = Dispatcher::new();
        disp.register(vec![RequestDescriptor::new(
            "REQ_CUSTOM",
            HandlerScope::Normal,
            Nop,
        )])
        .unwrap();

        let err = disp
            .register(vec![RequestDescriptor::new(
                "REQ_CUSTOM",
                HandlerScope::Normal,
                Nop,
            )])
            .unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateName(name) if name == "REQ_CUSTOM"));

        // Built-ins collide too.
        assert!(
            disp.register(vec![RequestDescriptor::new(
                "REQ_PING",
                HandlerScope::Normal,
                Nop,
            )])
            .is_err()
        );
    }

    #[test]
    fn io_health_tracks_the_most_recent_probe() {
        let disp = Dispatcher::new();
        assert!(disp.is_io_ok(), "never-touched dispatcher is healthy");

        disp.notify_io_status(false, "write error on /srv");
        assert!(!disp.is_io_ok());
        assert_eq!(disp.last_io_message(), "write error on /srv");

        disp.notify_io_status(true, "");
        assert!(disp.is_io_ok());
        assert_eq!(disp.last_io_message(), "n/a");
    }

    #[test]
    fn handler_names_include_the_builtins() {
        let disp = Dispatcher::new();
        let names = disp.handler_names();
        assert!(names.iter().any(|n| n == "REQ_PING"));
        assert!(names.iter().any(|n| n == "REQ_STATS"));
    }
}
