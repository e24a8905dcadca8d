//! Store-backed router
//!
//! The authoritative ring (sorted set of `server#index` tokens), server roster
//! and connection mapping live in a [`CoordinationStore`] shared by every
//! router instance. Each instance only keeps a version-stamped copy of the
//! ring for lookups:
//!
//! - every lookup compares the store's `version` with the cached one and
//!   rebuilds the whole ring on mismatch
//! - a background task runs the same check on a timer and when a change
//!   event arrives, so idle instances converge too
//! - the cache is replaced by swapping one `Arc`, readers never see a
//!   partially built ring
//!
//! Topology changes are multi-step and not transactional: each store call is
//! atomic, the sequence is not, and no cross-instance lock is taken.
//!
//! Known race on `add_server`: the connection snapshot is taken before the
//! ring changes, so connections first resolved between the snapshot and the
//! version bump are not part of the returned migration list. They were
//! resolved against the old ring by a peer and are corrected on their next
//! lookup.

use crate::common::{
    default_hasher, server_from_token, validate_id, Result, RouterConfig, RouterMetrics,
    SharedHasher,
};
use crate::router::refresh::{spawn_refresh_task, RefreshTask};
use crate::router::ring::{place, HashRing};
use crate::router::{ConnectionId, ConnectionRouter};
use crate::store::{
    ChangeAction, CoordinationStore, ServerChangeEvent, StoreKeys, FIELD_HASH_FUNCTION,
    FIELD_VERSION, FIELD_VIRTUAL_NODES,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Version reported before the first successful load.
const UNLOADED_VERSION: i64 = -1;

/// Local copy of the ring and the store version it was built from.
#[derive(Debug)]
pub struct RingCache {
    pub ring: HashRing,
    pub version: i64,
}

/// State shared between the router handle and its refresh task.
pub(crate) struct RouterCore {
    store: Arc<dyn CoordinationStore>,
    keys: StoreKeys,
    hasher: SharedHasher,
    virtual_nodes: usize,
    cache: RwLock<Arc<RingCache>>,
    instance_id: String,
    metrics: RouterMetrics,
}

impl RouterCore {
    pub(crate) fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn cache(&self) -> Arc<RingCache> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `cache` unless a newer version is already cached. Returns the
    /// built cache either way so callers route with what they loaded.
    fn swap_cache(&self, cache: RingCache) -> Arc<RingCache> {
        let cache = Arc::new(cache);
        let mut current = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.version < current.version {
            tracing::debug!(
                "Discarding ring version {}, version {} already cached",
                cache.version,
                current.version
            );
            return cache;
        }
        self.metrics.cache_version.set(cache.version.max(0) as u64);
        self.metrics.ring_positions.set(cache.ring.len() as u64);
        *current = cache.clone();
        cache
    }

    fn record_store_error(&self, context: &str, err: &crate::Error) {
        if err.is_store_failure() {
            self.metrics.store_errors.inc();
        }
        tracing::error!("{} failed: {}", context, err);
    }

    /// Seed the config hash on first use. Never resets an existing version.
    async fn initialize_config(&self) -> Result<()> {
        if !self.store.exists(&self.keys.config).await? {
            let entries = [
                (FIELD_VIRTUAL_NODES.to_string(), self.virtual_nodes.to_string()),
                (
                    FIELD_HASH_FUNCTION.to_string(),
                    self.hasher.label().to_string(),
                ),
            ];
            self.store.hset_many(&self.keys.config, &entries).await?;
        } else if let Some(stored) = self
            .store
            .hget(&self.keys.config, FIELD_VIRTUAL_NODES)
            .await?
        {
            if stored != self.virtual_nodes.to_string() {
                tracing::warn!(
                    "Ring config uses {} virtual nodes, this router uses {}",
                    stored,
                    self.virtual_nodes
                );
            }
        }
        // Incrementing by zero creates the field without touching an existing value.
        self.store
            .hincr_by(&self.keys.config, FIELD_VERSION, 0)
            .await?;
        Ok(())
    }

    async fn store_version(&self) -> Result<i64> {
        match self.store.hget(&self.keys.config, FIELD_VERSION).await? {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                crate::Error::Internal(format!("ring version is not an integer: {}", raw))
            }),
            None => Ok(0),
        }
    }

    /// Rebuild the cache from the store. Unless `force`, skip when the cached
    /// version is current. Returns the ring to route with and whether it was
    /// rebuilt.
    async fn load_ring(&self, force: bool) -> Result<(Arc<RingCache>, bool)> {
        let version = self.store_version().await?;
        let cached = self.cache();
        if !force && version == cached.version {
            return Ok((cached, false));
        }

        let members = self.store.zrange_with_scores(&self.keys.ring).await?;
        let entries = members
            .into_iter()
            .map(|(token, position)| (position, server_from_token(&token).to_string()));
        let ring = HashRing::from_entries(entries, self.virtual_nodes, self.hasher.clone());

        tracing::debug!(
            "Ring cache rebuilt: version {}, {} positions",
            version,
            ring.len()
        );
        let cache = self.swap_cache(RingCache { ring, version });
        self.metrics.cache_rebuilds.inc();
        Ok((cache, true))
    }

    /// Staleness check that never fails; errors are logged and the current
    /// cache stays in use.
    pub(crate) async fn refresh_if_needed(&self, reason: &str) -> bool {
        match self.load_ring(false).await {
            Ok((_, rebuilt)) => rebuilt,
            Err(e) => {
                self.record_store_error(&format!("Ring refresh ({})", reason), &e);
                false
            }
        }
    }

    async fn mapping_snapshot(&self) -> Result<HashMap<String, String>> {
        self.store.hgetall(&self.keys.mapping).await
    }

    async fn publish_change(&self, action: ChangeAction, server: &str) {
        let event = ServerChangeEvent::new(action, server, &self.instance_id);
        let result = match event.to_json() {
            Ok(payload) => self.store.publish(&self.keys.changes, &payload).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(receivers) => tracing::debug!(
                "Published {} {} to {} subscribers",
                action,
                server,
                receivers
            ),
            Err(e) => self.record_store_error("Publishing server change", &e),
        }
    }

    async fn resolve(&self, connection: &str) -> Option<String> {
        self.metrics.lookups.inc();
        self.refresh_if_needed("lookup").await;

        let server = match self.cache().ring.lookup(connection) {
            Ok(server) => server.to_string(),
            Err(_) => {
                self.metrics.empty_ring_lookups.inc();
                return None;
            }
        };

        // Last writer wins; a failed write only loses the bookkeeping entry.
        if let Err(e) = self
            .store
            .hset(&self.keys.mapping, connection, &server)
            .await
        {
            self.record_store_error(
                &format!("Recording mapping {} -> {}", connection, server),
                &e,
            );
        }
        Some(server)
    }

    async fn add_server(&self, server: &str) -> Result<Vec<String>> {
        validate_id("server", server)?;

        // A roster entry without ring tokens is a half-applied earlier add; redo it.
        let registered = self.store.sismember(&self.keys.servers, server).await?;
        let (current, _) = self.load_ring(false).await?;
        if registered && current.ring.contains_server(server) {
            tracing::info!("Server {} already registered, nothing to add", server);
            return Ok(Vec::new());
        }

        tracing::info!("Adding server: {}", server);
        let before = self.mapping_snapshot().await?;

        self.store.sadd(&self.keys.servers, server).await?;
        let tokens: Vec<(String, u64)> = place(&self.hasher, server, self.virtual_nodes)
            .into_iter()
            .map(|(position, token)| (token, position))
            .collect();
        self.store.zadd(&self.keys.ring, &tokens).await?;
        self.store
            .hincr_by(&self.keys.config, FIELD_VERSION, 1)
            .await?;
        let (cache, _) = self.load_ring(true).await?;

        let mut changed: Vec<(String, String)> = before
            .into_iter()
            .filter_map(|(connection, old)| match cache.ring.lookup(&connection) {
                Ok(new) if new != old => Some((connection, new.to_string())),
                _ => None,
            })
            .collect();
        changed.sort();

        if !changed.is_empty() {
            self.store.hset_many(&self.keys.mapping, &changed).await?;
        }
        let migrated: Vec<String> = changed.into_iter().map(|(connection, _)| connection).collect();

        self.publish_change(ChangeAction::Add, server).await;

        self.metrics.servers_added.inc();
        self.metrics
            .connections_migrated
            .add(migrated.len() as u64);
        tracing::info!(
            "Server {} added, {} connections migrated",
            server,
            migrated.len()
        );
        Ok(migrated)
    }

    async fn remove_server(&self, server: &str) -> Result<Vec<String>> {
        validate_id("server", server)?;
        tracing::info!("Removing server: {}", server);

        let owned_by = |mapping: HashMap<String, String>| -> BTreeSet<String> {
            mapping
                .into_iter()
                .filter(|(_, owner)| owner == server)
                .map(|(connection, _)| connection)
                .collect()
        };

        let mut migrating = owned_by(self.mapping_snapshot().await?);

        let was_registered = self.store.srem(&self.keys.servers, server).await?;
        let tokens: Vec<String> = self
            .store
            .zrange_with_scores(&self.keys.ring)
            .await?
            .into_iter()
            .map(|(token, _)| token)
            .filter(|token| server_from_token(token) == server)
            .collect();

        if !was_registered && tokens.is_empty() && migrating.is_empty() {
            tracing::info!("Server {} not registered, nothing to remove", server);
            return Ok(Vec::new());
        }

        if !tokens.is_empty() {
            self.store.zrem(&self.keys.ring, &tokens).await?;
        }
        self.store
            .hincr_by(&self.keys.config, FIELD_VERSION, 1)
            .await?;

        // Entries recorded by peers since the first snapshot still point here.
        migrating.extend(owned_by(self.mapping_snapshot().await?));
        let migrating: Vec<String> = migrating.into_iter().collect();
        if !migrating.is_empty() {
            self.store.hdel(&self.keys.mapping, &migrating).await?;
        }

        let (cache, _) = self.load_ring(true).await?;

        let reassigned: Vec<(String, String)> = migrating
            .iter()
            .filter_map(|connection| {
                cache
                    .ring
                    .lookup(connection)
                    .ok()
                    .map(|new| (connection.clone(), new.to_string()))
            })
            .collect();
        if !reassigned.is_empty() {
            self.store.hset_many(&self.keys.mapping, &reassigned).await?;
        }

        self.publish_change(ChangeAction::Remove, server).await;

        self.metrics.servers_removed.inc();
        self.metrics
            .connections_migrated
            .add(migrating.len() as u64);
        tracing::info!(
            "Server {} removed, {} connections migrated",
            server,
            migrating.len()
        );
        Ok(migrating)
    }

    async fn all_servers(&self) -> BTreeSet<String> {
        match self.store.smembers(&self.keys.servers).await {
            Ok(servers) => servers,
            Err(e) => {
                self.record_store_error("Listing servers", &e);
                BTreeSet::new()
            }
        }
    }

    async fn connections_on_server(&self, server: &str) -> BTreeSet<String> {
        match self.mapping_snapshot().await {
            Ok(mapping) => mapping
                .into_iter()
                .filter(|(_, owner)| owner == server)
                .map(|(connection, _)| connection)
                .collect(),
            Err(e) => {
                self.record_store_error(&format!("Listing connections on {}", server), &e);
                BTreeSet::new()
            }
        }
    }

    async fn all_connections(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mapping = match self.mapping_snapshot().await {
            Ok(mapping) => mapping,
            Err(e) => {
                self.record_store_error("Listing all connections", &e);
                return BTreeMap::new();
            }
        };

        let mut result: BTreeMap<String, BTreeSet<String>> = self
            .all_servers()
            .await
            .into_iter()
            .map(|server| (server, BTreeSet::new()))
            .collect();
        for (connection, server) in mapping {
            result.entry(server).or_default().insert(connection);
        }
        result
    }

    async fn drop_connection(&self, connection: &str) -> Option<String> {
        let previous = match self.store.hget(&self.keys.mapping, connection).await {
            Ok(previous) => previous,
            Err(e) => {
                self.record_store_error(&format!("Reading mapping of {}", connection), &e);
                return None;
            }
        };
        if let Err(e) = self
            .store
            .hdel(&self.keys.mapping, &[connection.to_string()])
            .await
        {
            self.record_store_error(&format!("Dropping mapping of {}", connection), &e);
        }
        previous
    }
}

/// Router whose authoritative state lives in a [`CoordinationStore`].
///
/// Owns a background refresh task; call [`shutdown`](Self::shutdown) to stop
/// it cleanly. Dropping the router aborts the task.
pub struct DistributedRouter {
    core: Arc<RouterCore>,
    refresh: Mutex<Option<RefreshTask>>,
    shutdown_grace: Duration,
}

impl DistributedRouter {
    /// Connect to `store`, seed the ring config if missing, load the ring and
    /// start the refresh task. Store failures during startup are logged and
    /// leave an empty cache that later checks repair.
    pub async fn start(store: Arc<dyn CoordinationStore>, config: &RouterConfig) -> Result<Self> {
        Self::start_with_hasher(store, config, default_hasher()).await
    }

    pub async fn start_with_hasher(
        store: Arc<dyn CoordinationStore>,
        config: &RouterConfig,
        hasher: SharedHasher,
    ) -> Result<Self> {
        config.validate()?;

        let core = Arc::new(RouterCore {
            store,
            keys: StoreKeys::new(config.namespace.as_deref()),
            hasher: hasher.clone(),
            virtual_nodes: config.virtual_nodes,
            cache: RwLock::new(Arc::new(RingCache {
                ring: HashRing::new(config.virtual_nodes, hasher),
                version: UNLOADED_VERSION,
            })),
            instance_id: uuid::Uuid::new_v4().to_string(),
            metrics: RouterMetrics::new(),
        });

        if let Err(e) = core.initialize_config().await {
            core.record_store_error("Initializing ring config", &e);
        }
        if let Err(e) = core.load_ring(false).await {
            core.record_store_error("Initial ring load", &e);
        }

        let events = match core.store.subscribe(&core.keys.changes).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                core.record_store_error("Subscribing to server changes", &e);
                None
            }
        };

        let refresh = spawn_refresh_task(
            core.clone(),
            config.refresh_initial_delay(),
            config.refresh_interval(),
            events,
        );

        tracing::info!(
            "Distributed router {} started ({} virtual nodes, cache version {})",
            core.instance_id,
            core.virtual_nodes,
            core.cache().version
        );

        Ok(Self {
            core,
            refresh: Mutex::new(Some(refresh)),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn instance_id(&self) -> &str {
        self.core.instance_id()
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.core.keys
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.core.metrics
    }

    /// Version of the locally cached ring (-1 before the first load).
    pub fn cached_version(&self) -> i64 {
        self.core.cache().version
    }

    /// Current cached ring.
    pub fn cached_ring(&self) -> Arc<RingCache> {
        self.core.cache()
    }

    /// Run the staleness check now. Returns true if the cache was rebuilt.
    pub async fn refresh_now(&self) -> bool {
        self.core.refresh_if_needed("manual").await
    }

    /// Stop the refresh task: signal it, wait up to the configured grace
    /// period, then abort. Returns false if it had to be aborted.
    pub async fn shutdown(&self) -> bool {
        let task = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                let clean = task.stop(self.shutdown_grace).await;
                tracing::info!(
                    "Distributed router {} stopped ({})",
                    self.core.instance_id,
                    if clean { "clean" } else { "aborted" }
                );
                clean
            }
            None => true,
        }
    }
}

impl Drop for DistributedRouter {
    fn drop(&mut self) {
        if let Some(task) = self
            .refresh
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[async_trait]
impl ConnectionRouter for DistributedRouter {
    async fn resolve(&self, connection: &ConnectionId) -> Option<String> {
        self.core.resolve(connection.as_str()).await
    }

    async fn drop_connection(&self, connection: &ConnectionId) -> Option<String> {
        self.core.drop_connection(connection.as_str()).await
    }

    async fn add_server(&self, server: &str) -> Result<Vec<String>> {
        self.core.add_server(server).await
    }

    async fn remove_server(&self, server: &str) -> Result<Vec<String>> {
        self.core.remove_server(server).await
    }

    async fn all_servers(&self) -> BTreeSet<String> {
        self.core.all_servers().await
    }

    async fn connections_on_server(&self, server: &str) -> BTreeSet<String> {
        self.core.connections_on_server(server).await
    }

    async fn all_connections(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.core.all_connections().await
    }

    async fn ring_snapshot(&self) -> Vec<(u64, String)> {
        self.core.refresh_if_needed("snapshot").await;
        self.core
            .cache()
            .ring
            .entries()
            .map(|(position, server)| (position, server.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn quiet() -> RouterConfig {
        RouterConfig {
            refresh_initial_delay_ms: 60_000,
            refresh_interval_ms: 60_000,
            ..RouterConfig::default()
        }
    }

    fn cache_at(version: i64) -> RingCache {
        RingCache {
            ring: HashRing::new(150, default_hasher()),
            version,
        }
    }

    #[tokio::test]
    async fn test_older_ring_never_replaces_newer() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let router = DistributedRouter::start(store, &quiet()).await.unwrap();
        router.add_server("node1").await.unwrap();
        assert_eq!(router.cached_version(), 1);

        // A lookup that read version 0 before the add finishes late
        let stale = router.core.swap_cache(cache_at(0));
        assert_eq!(stale.version, 0);
        assert_eq!(router.cached_version(), 1);
        assert!(router.cached_ring().ring.contains_server("node1"));

        let newer = router.core.swap_cache(cache_at(5));
        assert!(Arc::ptr_eq(&newer, &router.cached_ring()));
    }

    #[tokio::test]
    async fn test_topology_change_routes_with_ring_it_built() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let router = DistributedRouter::start(store, &quiet()).await.unwrap();
        router.add_server("node1").await.unwrap();

        let (built, rebuilt) = router.core.load_ring(true).await.unwrap();
        assert!(rebuilt);
        assert_eq!(built.version, 1);
        assert!(built.ring.contains_server("node1"));

        let (current, rebuilt) = router.core.load_ring(false).await.unwrap();
        assert!(!rebuilt);
        assert_eq!(current.version, 1);
    }
}
