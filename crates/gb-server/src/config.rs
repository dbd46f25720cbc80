//! Server tuning knobs.
//!
//! [`ServerConfig`] is the embeddable, deserializable snapshot a host
//! process builds at startup.  [`ServerVars`] is the live registry derived
//! from it: atomic slots readable on the hot path and writable through
//! SETCFG, dumped as JSON by GETCFG.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;

/// Startup configuration for an [`crate::server::RpcServer`].
///
/// All durations are milliseconds.  A zero `max_request_size` or
/// `max_memory` disables that limit; a zero `idle_timeout_ms` disables the
/// connection idle timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_request_size: u32,
    pub max_memory: u64,
    pub max_run_time_ms: u64,
    pub queue_max_delay_ms: u64,
    pub idle_timeout_ms: u64,
    pub perfdata_enabled: bool,
    pub disable_noisy_access_logs: bool,
    /// `host:port` of a statsd daemon; unset disables timing emission.
    pub statsd_addr: Option<String>,
    pub service_id: Option<String>,
    pub volume: Option<String>,
    pub namespace: String,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_request_size: 0,
            max_memory: 1 << 30,
            max_run_time_ms: 300_000,
            queue_max_delay_ms: 5_000,
            idle_timeout_ms: 300_000,
            perfdata_enabled: false,
            disable_noisy_access_logs: false,
            statsd_addr: None,
            service_id: None,
            volume: None,
            namespace: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Live variable registry
// ---------------------------------------------------------------------------

const VAR_MAX_SIZE: &str = "server.request.max_size";
const VAR_MAX_MEMORY: &str = "server.request.max_memory";
const VAR_MAX_RUN_TIME: &str = "server.request.max_run_time";
const VAR_QUEUE_MAX_DELAY: &str = "server.queue.max_delay";
const VAR_IDLE_TIMEOUT: &str = "server.cnx.timeout_idle";
const VAR_PERFDATA: &str = "server.perfdata";
const VAR_NOISY_DISABLED: &str = "server.log.access.noisy_disabled";

/// Mutable runtime tunables.
///
/// `max_memory` is reported but rejected by [`ServerVars::apply`]: the
/// memory budget capacity is fixed once connections are reserving against
/// it.
pub struct ServerVars {
    max_request_size: AtomicU32,
    max_memory: u64,
    max_run_time_ms: AtomicU64,
    queue_max_delay_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    perfdata_enabled: AtomicBool,
    disable_noisy_access_logs: AtomicBool,
}

impl ServerVars {
    pub fn from_config(cfg: &ServerConfig) -> ServerVars {
        ServerVars {
            max_request_size: AtomicU32::new(cfg.max_request_size),
            max_memory: cfg.max_memory,
            max_run_time_ms: AtomicU64::new(cfg.max_run_time_ms),
            queue_max_delay_ms: AtomicU64::new(cfg.queue_max_delay_ms),
            idle_timeout_ms: AtomicU64::new(cfg.idle_timeout_ms),
            perfdata_enabled: AtomicBool::new(cfg.perfdata_enabled),
            disable_noisy_access_logs: AtomicBool::new(cfg.disable_noisy_access_logs),
        }
    }

    pub fn max_request_size(&self) -> u32 {
        self.max_request_size.load(Ordering::Relaxed)
    }

    pub fn max_run_time(&self) -> Duration {
        Duration::from_millis(self.max_run_time_ms.load(Ordering::Relaxed))
    }

    pub fn queue_max_delay(&self) -> Duration {
        Duration::from_millis(self.queue_max_delay_ms.load(Ordering::Relaxed))
    }

    /// Zero means no idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn perfdata_enabled(&self) -> bool {
        self.perfdata_enabled.load(Ordering::Relaxed)
    }

    pub fn noisy_logs_disabled(&self) -> bool {
        self.disable_noisy_access_logs.load(Ordering::Relaxed)
    }

    /// Registry contents for GETCFG.
    pub fn as_json(&self) -> serde_json::Value {
        let mut dump = serde_json::Map::new();
        dump.insert(VAR_MAX_SIZE.to_owned(), self.max_request_size().into());
        dump.insert(VAR_MAX_MEMORY.to_owned(), self.max_memory.into());
        dump.insert(
            VAR_MAX_RUN_TIME.to_owned(),
            self.max_run_time_ms.load(Ordering::Relaxed).into(),
        );
        dump.insert(
            VAR_QUEUE_MAX_DELAY.to_owned(),
            self.queue_max_delay_ms.load(Ordering::Relaxed).into(),
        );
        dump.insert(
            VAR_IDLE_TIMEOUT.to_owned(),
            self.idle_timeout_ms.load(Ordering::Relaxed).into(),
        );
        dump.insert(VAR_PERFDATA.to_owned(), self.perfdata_enabled().into());
        dump.insert(VAR_NOISY_DISABLED.to_owned(), self.noisy_logs_disabled().into());
        serde_json::Value::Object(dump)
    }

    /// Apply one SETCFG entry.  Returns whether the value was accepted.
    pub fn apply(&self, name: &str, value: &str) -> bool {
        match name {
            VAR_MAX_SIZE => store_u32(&self.max_request_size, value),
            VAR_MAX_RUN_TIME => store_u64(&self.max_run_time_ms, value),
            VAR_QUEUE_MAX_DELAY => store_u64(&self.queue_max_delay_ms, value),
            VAR_IDLE_TIMEOUT => store_u64(&self.idle_timeout_ms, value),
            VAR_PERFDATA => store_bool(&self.perfdata_enabled, value),
            VAR_NOISY_DISABLED => store_bool(&self.disable_noisy_access_logs, value),
            _ => false,
        }
    }
}

fn store_u32(slot: &AtomicU32, value: &str) -> bool {
    match value.parse() {
        Ok(v) => {
            slot.store(v, Ordering::Relaxed);
            true
        }
        Err(_) => false,
    }
}

fn store_u64(slot: &AtomicU64, value: &str) -> bool {
    match value.parse() {
        Ok(v) => {
            slot.store(v, Ordering::Relaxed);
            true
        }
        Err(_) => false,
    }
}

fn store_bool(slot: &AtomicBool, value: &str) -> bool {
    let parsed = match value {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    };
    match parsed {
        Some(v) => {
            slot.store(v, Ordering::Relaxed);
            true
        }
        None => false,
    }
}
