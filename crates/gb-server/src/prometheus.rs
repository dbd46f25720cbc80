//! Conversion of the stats snapshot to Prometheus text format.
//!
//! Only the known sample families are exported; `req.hits`/`req.time`
//! aggregates are skipped on purpose (the scraper sums the per-method
//! series), anything unrecognized is logged and dropped.

use std::fmt::Write as _;

use tracing::warn;

/// Stats-table time samples are microseconds; Prometheus wants seconds.
const TIME_BASE: f64 = 1_000_000.0;

/// Render `samples` (key = `<kind> <name>`, value = u64) as Prometheus
/// text.  Every line carries `service_id` (when set), `volume` and
/// `namespace` labels, in that order, before any family-specific label.
pub fn stats_to_prometheus(
    samples: &[(String, u64)],
    service_id: Option<&str>,
    volume: &str,
    namespace: &str,
) -> String {
    let mut out = String::with_capacity(samples.len() * 64);

    for (key, value) in samples {
        let Some((kind, name)) = key.split_once(' ') else {
            warn!(stat = %key, "statistic not supported for the prometheus format");
            continue;
        };

        let (suffix, extra_label, in_seconds) = match classify(kind, name) {
            Classified::Metric(m) => m,
            Classified::SilentSkip => continue,
            Classified::Unknown => {
                warn!(stat = %key, "statistic not supported for the prometheus format");
                continue;
            }
        };

        out.push_str("meta_");
        out.push_str(suffix);
        out.push('{');
        if let Some(service_id) = service_id {
            let _ = write!(out, "service_id=\"{service_id}\",");
        }
        let _ = write!(out, "volume=\"{volume}\",namespace=\"{namespace}\"");
        if let Some((label, label_value)) = extra_label {
            let _ = write!(out, ",{label}=\"{label_value}\"");
        }
        out.push_str("} ");
        if in_seconds {
            let _ = writeln!(out, "{:.6}", *value as f64 / TIME_BASE);
        } else {
            let _ = writeln!(out, "{value}");
        }
    }

    out
}

enum Classified<'a> {
    Metric((&'static str, Option<(&'static str, &'a str)>, bool)),
    SilentSkip,
    Unknown,
}

fn classify<'a>(kind: &str, name: &'a str) -> Classified<'a> {
    let tokens: Vec<&str> = name.split('.').collect();
    match kind {
        "counter" => match tokens.as_slice() {
            ["req", "hits", method] => {
                Classified::Metric(("requests_total", Some(("method", method)), false))
            }
            ["req", "time", method] => Classified::Metric((
                "requests_duration_second_total",
                Some(("method", method)),
                true,
            )),
            ["req", "lag", method] => Classified::Metric((
                "requests_lag_second_total",
                Some(("method", method)),
                true,
            )),
            // Sums over all methods; the scraper recomputes these.
            ["req", "hits"] | ["req", "time"] => Classified::SilentSkip,
            ["cnx", cnx_type] => {
                Classified::Metric(("connections_total", Some(("type", cnx_type)), false))
            }
            _ => Classified::Unknown,
        },
        "gauge" => match tokens.as_slice() {
            ["thread", "active"] => Classified::Metric(("threads_active", None, false)),
            ["cnx", "client"] => Classified::Metric(("connections_active", None, false)),
            _ => Classified::Unknown,
        },
        _ => Classified::Unknown,
    }
}
