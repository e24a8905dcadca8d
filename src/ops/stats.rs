//! Ring status and load-balance reports

use crate::router::ConnectionRouter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Per-server view of the ring: positions held and share of the keyspace.
#[derive(Debug, Clone, Serialize)]
pub struct RingReport {
    pub total_positions: usize,
    pub servers: BTreeMap<String, ServerArc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerArc {
    pub positions: usize,
    /// Fraction of the 64-bit keyspace routed to this server
    pub share: f64,
}

impl RingReport {
    /// Build from ordered `(position, server)` entries.
    ///
    /// A position owns the arc from the previous position (exclusive) up to
    /// itself; the first position also owns the wrap-around arc.
    pub fn from_entries(entries: &[(u64, String)]) -> Self {
        let mut servers: BTreeMap<String, ServerArc> = BTreeMap::new();
        let keyspace = u64::MAX as f64 + 1.0;

        for (i, (position, server)) in entries.iter().enumerate() {
            let previous = if i == 0 {
                entries[entries.len() - 1].0
            } else {
                entries[i - 1].0
            };
            let arc = if entries.len() == 1 {
                keyspace
            } else {
                position.wrapping_sub(previous) as f64
            };
            let slot = servers.entry(server.clone()).or_default();
            slot.positions += 1;
            slot.share += arc / keyspace;
        }

        Self {
            total_positions: entries.len(),
            servers,
        }
    }

    pub async fn collect(router: &dyn ConnectionRouter) -> Self {
        Self::from_entries(&router.ring_snapshot().await)
    }
}

impl fmt::Display for RingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Ring: {} positions", self.total_positions)?;
        for (server, arc) in &self.servers {
            writeln!(
                f,
                "  {:<20} {:>6} positions  {:>6.2}% of keyspace",
                server,
                arc.positions,
                arc.share * 100.0
            )?;
        }
        Ok(())
    }
}

/// Connection counts per server.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub total_connections: usize,
    pub per_server: BTreeMap<String, usize>,
}

impl LoadReport {
    pub fn from_counts(per_server: BTreeMap<String, usize>) -> Self {
        Self {
            total_connections: per_server.values().sum(),
            per_server,
        }
    }

    pub async fn collect(router: &dyn ConnectionRouter) -> Self {
        let per_server = router
            .all_connections()
            .await
            .into_iter()
            .map(|(server, connections)| (server, connections.len()))
            .collect();
        Self::from_counts(per_server)
    }

    /// Busiest server load divided by the mean (1.0 = perfectly even).
    pub fn imbalance(&self) -> f64 {
        if self.per_server.is_empty() || self.total_connections == 0 {
            return 1.0;
        }
        let mean = self.total_connections as f64 / self.per_server.len() as f64;
        let max = self.per_server.values().copied().max().unwrap_or(0) as f64;
        max / mean
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Load: {} connections on {} servers (imbalance {:.2})",
            self.total_connections,
            self.per_server.len(),
            self.imbalance()
        )?;
        for (server, count) in &self.per_server {
            writeln!(f, "  {:<20} {:>8} connections", server, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_position_owns_everything() {
        let report = RingReport::from_entries(&[(42, "a".to_string())]);
        assert_eq!(report.total_positions, 1);
        assert!((report.servers["a"].share - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_shares_sum_to_one() {
        let entries = vec![
            (10, "a".to_string()),
            (u64::MAX / 2, "b".to_string()),
            (u64::MAX - 5, "a".to_string()),
        ];
        let report = RingReport::from_entries(&entries);
        let total: f64 = report.servers.values().map(|s| s.share).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(report.servers["a"].positions, 2);
        assert!((report.servers["b"].share - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_empty_ring_report() {
        let report = RingReport::from_entries(&[]);
        assert_eq!(report.total_positions, 0);
        assert!(report.servers.is_empty());
    }

    #[test]
    fn test_load_imbalance() {
        let counts = BTreeMap::from([("a".to_string(), 30), ("b".to_string(), 10)]);
        let report = LoadReport::from_counts(counts);
        assert_eq!(report.total_connections, 40);
        assert!((report.imbalance() - 1.5).abs() < 1e-9);
        assert!(report.to_string().contains("40 connections on 2 servers"));
    }
}
