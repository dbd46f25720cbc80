//! Process-wide request statistics.
//!
//! Samples are keyed by `<kind> <name>` strings (`counter req.hits.PING`,
//! `gauge cnx.client`).  The STATS handler renders a snapshot either as
//! plain text or through the Prometheus converter.

use std::collections::BTreeMap;
use std::sync::RwLock;

pub const KEY_HITS_ALL: &str = "counter req.hits";
pub const KEY_TIME_ALL: &str = "counter req.time";
pub const KEY_CNX_ACCEPT: &str = "counter cnx.accept";
pub const KEY_CNX_CLOSE: &str = "counter cnx.close";
pub const KEY_CNX_CLIENT: &str = "gauge cnx.client";
pub const KEY_THREAD_ACTIVE: &str = "gauge thread.active";

/// Pseudo-methods for requests that never reached a handler.
pub const METHOD_UNEXPECTED: &str = "UNEXPECTED";
pub const METHOD_OVERLOADED: &str = "OVERLOADED";
pub const METHOD_IOERROR: &str = "IOERROR";

pub fn key_hits(method: &str) -> String {
    format!("counter req.hits.{method}")
}

pub fn key_time(method: &str) -> String {
    format!("counter req.time.{method}")
}

#[derive(Default)]
pub struct StatsTable {
    inner: RwLock<BTreeMap<String, u64>>,
}

impl StatsTable {
    pub fn add(&self, key: &str, delta: u64) {
        let mut map = self.inner.write().expect("stats lock poisoned");
        *map.entry(key.to_owned()).or_insert(0) += delta;
    }

    pub fn sub(&self, key: &str, delta: u64) {
        let mut map = self.inner.write().expect("stats lock poisoned");
        let slot = map.entry(key.to_owned()).or_insert(0);
        *slot = slot.saturating_sub(delta);
    }

    pub fn set(&self, key: &str, value: u64) {
        let mut map = self.inner.write().expect("stats lock poisoned");
        map.insert(key.to_owned(), value);
    }

    pub fn get(&self, key: &str) -> u64 {
        let map = self.inner.read().expect("stats lock poisoned");
        map.get(key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let map = self.inner.read().expect("stats lock poisoned");
        map.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_gauges_clamp() {
        let stats = StatsTable::default();
        stats.add(&key_hits("PING"), 1);
        stats.add(&key_hits("PING"), 2);
        assert_eq!(stats.get("counter req.hits.PING"), 3);

        stats.set(KEY_CNX_CLIENT, 1);
        stats.sub(KEY_CNX_CLIENT, 5);
        assert_eq!(stats.get(KEY_CNX_CLIENT), 0);
    }
}
