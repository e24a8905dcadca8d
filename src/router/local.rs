//! In-process router
//!
//! Owns the hash ring plus two views of the connection table
//! (server → connections, connection → server) behind one `RwLock`.
//! Lookups of already-recorded connections only take the read lock; every
//! topology change runs under a single write lock, so no observer ever sees
//! a half-applied migration.

use crate::common::{
    default_hasher, validate_id, Result, RouterConfig, RouterMetrics, SharedHasher,
};
use crate::router::ring::HashRing;
use crate::router::{ConnectionId, ConnectionRouter};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct LocalState {
    ring: HashRing,
    server_connections: HashMap<String, HashSet<String>>,
    connection_to_server: HashMap<String, String>,
}

impl LocalState {
    /// Record `connection` on `server`, detaching it from any previous server.
    fn assign(&mut self, connection: &str, server: &str) {
        if let Some(previous) = self
            .connection_to_server
            .insert(connection.to_string(), server.to_string())
        {
            if previous != server {
                if let Some(set) = self.server_connections.get_mut(&previous) {
                    set.remove(connection);
                }
            }
        }
        self.server_connections
            .entry(server.to_string())
            .or_default()
            .insert(connection.to_string());
    }

    fn unassign(&mut self, connection: &str) -> Option<String> {
        let previous = self.connection_to_server.remove(connection)?;
        if let Some(set) = self.server_connections.get_mut(&previous) {
            set.remove(connection);
        }
        Some(previous)
    }
}

/// Single-process router. Construct one per process (or per test) and share it
/// by reference or `Arc`.
#[derive(Debug)]
pub struct LocalRouter {
    state: RwLock<LocalState>,
    metrics: RouterMetrics,
}

impl LocalRouter {
    pub fn new(virtual_nodes: usize) -> Self {
        Self::with_hasher(virtual_nodes, default_hasher())
    }

    pub fn with_hasher(virtual_nodes: usize, hasher: SharedHasher) -> Self {
        Self {
            state: RwLock::new(LocalState {
                ring: HashRing::new(virtual_nodes, hasher),
                server_connections: HashMap::new(),
                connection_to_server: HashMap::new(),
            }),
            metrics: RouterMetrics::new(),
        }
    }

    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.virtual_nodes))
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    fn read(&self) -> RwLockReadGuard<'_, LocalState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LocalState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find the server for `connection` and record the assignment.
    ///
    /// Returns `None` when no server is registered.
    pub fn resolve_key(&self, connection: &str) -> Option<String> {
        self.metrics.lookups.inc();

        {
            let state = self.read();
            match state.ring.lookup(connection) {
                Err(_) => {
                    self.metrics.empty_ring_lookups.inc();
                    return None;
                }
                Ok(server) => {
                    let recorded = state.connection_to_server.get(connection);
                    if recorded.map(String::as_str) == Some(server) {
                        return Some(server.to_string());
                    }
                }
            }
        }

        // The ring may have changed between the two locks, so look up again.
        let mut state = self.write();
        let server = match state.ring.lookup(connection) {
            Ok(server) => server.to_string(),
            Err(_) => {
                self.metrics.empty_ring_lookups.inc();
                return None;
            }
        };
        state.assign(connection, &server);
        Some(server)
    }

    /// Forget a connection.
    pub fn drop_key(&self, connection: &str) -> Option<String> {
        self.write().unassign(connection)
    }

    /// Place `server` on the ring and move every known connection whose owner
    /// changed. Adding a server that is already present is a no-op.
    pub fn join(&self, server: &str) -> Result<Vec<String>> {
        validate_id("server", server)?;
        let mut state = self.write();

        if state.ring.contains_server(server) {
            tracing::info!("Server {} already on the ring, nothing to add", server);
            return Ok(Vec::new());
        }

        tracing::info!("Adding server: {}", server);
        state.ring.add_server(server);
        state.server_connections.entry(server.to_string()).or_default();

        let reassigned: Vec<(String, String)> = state
            .connection_to_server
            .iter()
            .filter_map(|(connection, old)| match state.ring.lookup(connection) {
                Ok(new) if new != old.as_str() => Some((connection.clone(), new.to_string())),
                _ => None,
            })
            .collect();

        let mut migrated = Vec::with_capacity(reassigned.len());
        for (connection, new) in reassigned {
            state.assign(&connection, &new);
            migrated.push(connection);
        }

        self.metrics.servers_added.inc();
        self.metrics.connections_migrated.add(migrated.len() as u64);
        self.metrics.ring_positions.set(state.ring.len() as u64);
        tracing::info!(
            "Server {} added, {} connections migrated",
            server,
            migrated.len()
        );
        Ok(migrated)
    }

    /// Strip `server` from the ring and re-home its connections. Connections
    /// become unassigned when the ring ends up empty.
    pub fn leave(&self, server: &str) -> Result<Vec<String>> {
        validate_id("server", server)?;
        let mut state = self.write();

        tracing::info!("Removing server: {}", server);
        let removed = state.ring.remove_server(server);
        let mut migrated: Vec<String> = state
            .server_connections
            .remove(server)
            .unwrap_or_default()
            .into_iter()
            .collect();
        migrated.sort();

        for connection in &migrated {
            let owner = state.ring.lookup(connection).map(str::to_string);
            match owner {
                Ok(new) => state.assign(connection, &new),
                Err(_) => {
                    state.connection_to_server.remove(connection);
                }
            }
        }

        if !removed.is_empty() {
            self.metrics.servers_removed.inc();
        }
        self.metrics.connections_migrated.add(migrated.len() as u64);
        self.metrics.ring_positions.set(state.ring.len() as u64);
        tracing::info!(
            "Server {} removed, {} connections migrated",
            server,
            migrated.len()
        );
        Ok(migrated)
    }

    pub fn servers(&self) -> BTreeSet<String> {
        self.read().ring.servers()
    }

    pub fn connections_of(&self, server: &str) -> BTreeSet<String> {
        self.read()
            .server_connections
            .get(server)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_table(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.read()
            .server_connections
            .iter()
            .map(|(server, set)| (server.clone(), set.iter().cloned().collect()))
            .collect()
    }

    /// Current server of a connection without recording anything.
    pub fn assigned_server(&self, connection: &str) -> Option<String> {
        self.read().connection_to_server.get(connection).cloned()
    }

    pub fn ring_entries(&self) -> Vec<(u64, String)> {
        self.read()
            .ring
            .entries()
            .map(|(pos, server)| (pos, server.to_string()))
            .collect()
    }
}

impl Default for LocalRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default().virtual_nodes)
    }
}

#[async_trait]
impl ConnectionRouter for LocalRouter {
    async fn resolve(&self, connection: &ConnectionId) -> Option<String> {
        self.resolve_key(connection.as_str())
    }

    async fn drop_connection(&self, connection: &ConnectionId) -> Option<String> {
        self.drop_key(connection.as_str())
    }

    async fn add_server(&self, server: &str) -> Result<Vec<String>> {
        self.join(server)
    }

    async fn remove_server(&self, server: &str) -> Result<Vec<String>> {
        self.leave(server)
    }

    async fn all_servers(&self) -> BTreeSet<String> {
        self.servers()
    }

    async fn connections_on_server(&self, server: &str) -> BTreeSet<String> {
        self.connections_of(server)
    }

    async fn all_connections(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.connection_table()
    }

    async fn ring_snapshot(&self) -> Vec<(u64, String)> {
        self.ring_entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_empty_ring() {
        let router = LocalRouter::new(10);
        assert_eq!(router.resolve_key("user:1"), None);
        assert_eq!(router.metrics().empty_ring_lookups.get(), 1);
    }

    #[test]
    fn test_resolve_records_assignment() {
        let router = LocalRouter::new(10);
        router.join("node1").unwrap();

        let server = router.resolve_key("user:1").unwrap();
        assert_eq!(server, "node1");
        assert_eq!(router.assigned_server("user:1").as_deref(), Some("node1"));
        assert!(router.connections_of("node1").contains("user:1"));
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let router = LocalRouter::new(10);
        router.join("node1").unwrap();
        router.resolve_key("user:1");

        assert!(router.join("node1").unwrap().is_empty());
        assert_eq!(router.ring_entries().len(), 10);
    }

    #[test]
    fn test_join_rejects_blank_server() {
        let router = LocalRouter::new(10);
        assert!(matches!(
            router.join(""),
            Err(crate::Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_leave_last_server_unassigns() {
        let router = LocalRouter::new(10);
        router.join("node1").unwrap();
        router.resolve_key("user:1");
        router.resolve_key("user:2");

        let migrated = router.leave("node1").unwrap();
        assert_eq!(migrated, vec!["user:1".to_string(), "user:2".to_string()]);
        assert_eq!(router.assigned_server("user:1"), None);
        assert!(router.servers().is_empty());
        assert!(router.connection_table().is_empty());
    }

    #[test]
    fn test_leave_unknown_server() {
        let router = LocalRouter::new(10);
        router.join("node1").unwrap();
        assert!(router.leave("ghost").unwrap().is_empty());
        assert_eq!(router.metrics().servers_removed.get(), 0);
    }

    #[test]
    fn test_drop_key() {
        let router = LocalRouter::new(10);
        router.join("node1").unwrap();
        router.resolve_key("service:9");

        assert_eq!(router.drop_key("service:9").as_deref(), Some("node1"));
        assert!(router.connections_of("node1").is_empty());
        assert_eq!(router.drop_key("service:9"), None);
    }
}
