//! Access-log and statsd emission, one record per finalized request.
//!
//! The line is tab-separated with a stable key order so downstream parsers
//! can index by position.  Missing string values render as `-`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use tracing::info;

use gb_proto::status;

use crate::server::ServerShared;

/// Log target the access line is emitted through, so hosts can route it
/// to a dedicated sink.
pub const ACCESS_TARGET: &str = "gridbus::access";

pub struct AccessRecord<'a> {
    pub local: &'a str,
    pub peer: &'a str,
    pub method: &'a str,
    pub code: u32,
    pub arrival: Instant,
    pub parsed: Instant,
    pub end: Instant,
    pub bytes_recvd: u64,
    pub bytes_sent: u64,
    pub reqid: &'a str,
    pub db_wait: Duration,
    pub perfdata: Option<BTreeMap<String, Duration>>,
    pub subject: &'a str,
    pub access_disabled: bool,
}

fn ensure(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

/// Render the tab-separated line; pure so it can be asserted on directly.
pub fn build_line(rec: &AccessRecord<'_>) -> String {
    let total = rec.end.saturating_duration_since(rec.arrival).as_secs_f64();
    let handler = rec.end.saturating_duration_since(rec.parsed).as_secs_f64();
    let db_wait = rec.db_wait.as_secs_f64();

    let mut line = String::with_capacity(256);
    let _ = write!(
        line,
        "local:{}\tpeer:{}\tmethod:{}\tstatus_int:{}\trequest_time_float:{:.6}\
         \tbytes_recvd_int:{}\tbytes_sent_int:{}\trequest_id:{}",
        ensure(rec.local),
        ensure(rec.peer),
        ensure(rec.method),
        rec.code,
        total,
        rec.bytes_recvd,
        rec.bytes_sent,
        ensure(rec.reqid),
    );
    let _ = write!(
        line,
        "\ttime_spent_handler_float:{handler:.6}\tdb_wait_float:{db_wait:.6}\
         \tprocess_time_float:{:.6}",
        handler - db_wait,
    );
    if let Some(perfdata) = &rec.perfdata {
        for (name, elapsed) in perfdata {
            let _ = write!(line, "\tperfdata_{name}_float:{:.6}", elapsed.as_secs_f64());
        }
    }
    if !rec.subject.is_empty() {
        line.push('\t');
        line.push_str(rec.subject);
    }
    line
}

/// Emit the statsd timer and, unless suppressed, the access-log line.
pub fn emit(server: &ServerShared, rec: &AccessRecord<'_>) {
    if let Some(statsd) = &server.statsd {
        let millis = rec.end.saturating_duration_since(rec.arrival).as_millis();
        statsd.timing(
            &format!("request.{}.{}.timing", ensure(rec.method), rec.code),
            millis,
        );
    }

    // Handlers opting out of access logging only win for successful
    // requests, and only while nobody is debugging.
    if server.vars.noisy_logs_disabled()
        && rec.access_disabled
        && status::is_ok(rec.code)
        && !tracing::enabled!(target: ACCESS_TARGET, tracing::Level::DEBUG)
    {
        return;
    }

    info!(target: "gridbus::access", "{}", build_line(rec));
}
