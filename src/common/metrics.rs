//! Router metrics
//!
//! Lock-free counters and gauges updated on the routing hot path, rendered in
//! Prometheus text format on demand.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for tracking event counts
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Activity of one router instance.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub lookups: Counter,
    pub empty_ring_lookups: Counter,
    pub servers_added: Counter,
    pub servers_removed: Counter,
    pub connections_migrated: Counter,
    pub cache_rebuilds: Counter,
    pub store_errors: Counter,
    pub ring_positions: Gauge,
    pub cache_version: Gauge,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Export in Prometheus text format
    pub fn render_prometheus(&self, prefix: &str) -> String {
        let mut out = String::new();
        let counters = [
            ("lookups_total", "Connection lookups served", &self.lookups),
            (
                "empty_ring_lookups_total",
                "Lookups that found no server",
                &self.empty_ring_lookups,
            ),
            ("servers_added_total", "Servers added to the ring", &self.servers_added),
            (
                "servers_removed_total",
                "Servers removed from the ring",
                &self.servers_removed,
            ),
            (
                "connections_migrated_total",
                "Connections reassigned by topology changes",
                &self.connections_migrated,
            ),
            (
                "cache_rebuilds_total",
                "Local ring cache rebuilds",
                &self.cache_rebuilds,
            ),
            (
                "store_errors_total",
                "Failed coordination store calls",
                &self.store_errors,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {}_{} {}", prefix, name, help);
            let _ = writeln!(out, "# TYPE {}_{} counter", prefix, name);
            let _ = writeln!(out, "{}_{} {}", prefix, name, counter.get());
        }

        let gauges = [
            ("ring_positions", "Virtual nodes on the ring", &self.ring_positions),
            ("cache_version", "Ring version of the local cache", &self.cache_version),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {}_{} {}", prefix, name, help);
            let _ = writeln!(out, "# TYPE {}_{} gauge", prefix, name);
            let _ = writeln!(out, "{}_{} {}", prefix, name, gauge.get());
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = RouterMetrics::new();
        metrics.lookups.add(3);
        metrics.ring_positions.set(300);

        let text = metrics.render_prometheus("ringroute");
        assert!(text.contains("# TYPE ringroute_lookups_total counter"));
        assert!(text.contains("ringroute_lookups_total 3"));
        assert!(text.contains("ringroute_ring_positions 300"));
    }
}
