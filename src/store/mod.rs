//! Coordination store abstraction
//!
//! The distributed router keeps its authoritative state in a shared store
//! offering sorted sets, sets, hashes, an atomic counter and pub/sub. Any
//! backend with those primitives can implement [`CoordinationStore`]; each
//! individual call must be atomic, multi-call sequences are not.
//!
//! Key layout (optionally prefixed by a namespace):
//!
//! | Key                  | Structure  | Contents                                   |
//! |----------------------|------------|--------------------------------------------|
//! | `hash_ring:nodes`    | sorted set | member `server#index`, score = position    |
//! | `im_servers`         | set        | server ids                                 |
//! | `connection_mapping` | hash       | connection id → server id                  |
//! | `hash_ring:config`   | hash       | `virtual_nodes`, `hash_function`, `version`|
//! | `im_server_changes`  | channel    | JSON [`ServerChangeEvent`]                 |

pub mod events;
pub mod memory;
pub mod timeout;

pub use events::{ChangeAction, ServerChangeEvent};
pub use memory::MemoryStore;
pub use timeout::TimeoutStore;

use crate::common::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::broadcast;

const RING_KEY: &str = "hash_ring:nodes";
const SERVERS_KEY: &str = "im_servers";
const MAPPING_KEY: &str = "connection_mapping";
const CONFIG_KEY: &str = "hash_ring:config";
const CHANGES_CHANNEL: &str = "im_server_changes";

/// Field names of the config hash.
pub const FIELD_VIRTUAL_NODES: &str = "virtual_nodes";
pub const FIELD_HASH_FUNCTION: &str = "hash_function";
pub const FIELD_VERSION: &str = "version";

/// Resolved store keys for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    pub ring: String,
    pub servers: String,
    pub mapping: String,
    pub config: String,
    pub changes: String,
}

impl StoreKeys {
    /// Keys prefixed with `namespace:`, or the bare layout when `None`.
    pub fn new(namespace: Option<&str>) -> Self {
        let key = |name: &str| match namespace {
            Some(ns) => format!("{}:{}", ns, name),
            None => name.to_string(),
        };
        Self {
            ring: key(RING_KEY),
            servers: key(SERVERS_KEY),
            mapping: key(MAPPING_KEY),
            config: key(CONFIG_KEY),
            changes: key(CHANGES_CHANNEL),
        }
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Primitives the distributed router needs from the shared store.
///
/// Implementations are expected to bound every call in time (see
/// [`TimeoutStore`]) and to surface failures as
/// [`crate::Error::StoreUnavailable`] or [`crate::Error::Timeout`].
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // === Sorted sets ===

    /// Add or update members with their scores.
    async fn zadd(&self, key: &str, members: &[(String, u64)]) -> Result<()>;

    /// Remove members. Returns how many existed.
    async fn zrem(&self, key: &str, members: &[String]) -> Result<usize>;

    /// All members with scores, ascending by score.
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, u64)>>;

    // === Sets ===

    /// Returns true if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns true if the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>>;

    // === Hashes ===

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hset_many(&self, key: &str, entries: &[(String, String)]) -> Result<()>;

    /// Delete fields. Returns how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Atomically add `delta` to an integer field (missing counts as 0).
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    // === Keys ===

    async fn exists(&self, key: &str) -> Result<bool>;

    // === Pub/sub ===

    /// Best-effort publish. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let keys = StoreKeys::default();
        assert_eq!(keys.ring, "hash_ring:nodes");
        assert_eq!(keys.servers, "im_servers");
        assert_eq!(keys.mapping, "connection_mapping");
        assert_eq!(keys.config, "hash_ring:config");
        assert_eq!(keys.changes, "im_server_changes");
    }

    #[test]
    fn test_namespaced_keys() {
        let keys = StoreKeys::new(Some("chat"));
        assert_eq!(keys.ring, "chat:hash_ring:nodes");
        assert_eq!(keys.changes, "chat:im_server_changes");
    }
}
