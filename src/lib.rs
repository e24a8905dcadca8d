//! # ringroute
//!
//! Routes client and agent connections to the nodes of a horizontally scaled
//! real-time messaging cluster with consistent hashing:
//! - Hash ring with virtual nodes (150 per server by default)
//! - Minimal migration sets on server add/remove
//! - In-process router for single-node deployments
//! - Stateless router backed by a shared coordination store, with a
//!   version-stamped local ring cache and background refresh
//!
//! ## Architecture
//!
//! ```text
//!      transport layer / admin tools
//!                 │  ConnectionRouter
//!       ┌─────────┴──────────┐
//!       │                    │
//! ┌─────▼──────┐     ┌───────▼─────────────┐
//! │ LocalRouter│     │ DistributedRouter   │ × N instances
//! │ ring + map │     │ ring cache (version)│
//! └────────────┘     └───────┬─────────────┘
//!                            │ CoordinationStore
//!                  ┌─────────▼──────────────────┐
//!                  │ hash_ring:nodes  (zset)    │
//!                  │ im_servers       (set)     │
//!                  │ connection_mapping (hash)  │
//!                  │ hash_ring:config (hash)    │
//!                  │ im_server_changes (pubsub) │
//!                  └────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ringroute::{ConnectionRouter, LocalRouter};
//!
//! # async fn demo() -> ringroute::Result<()> {
//! let router = LocalRouter::new(150);
//! router.add_server("node1").await?;
//! router.add_server("node2").await?;
//!
//! let server = router.add_user("42").await?;
//! assert!(server.is_some());
//!
//! let migrated = router.add_server("node3").await?;
//! println!("{} connections must move", migrated.len());
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod ops;
pub mod router;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result, RouterConfig, RouterMode};
pub use router::{ConnectionId, ConnectionRouter, DistributedRouter, HashRing, LocalRouter, Role};
pub use store::{CoordinationStore, MemoryStore, TimeoutStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
