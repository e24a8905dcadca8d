//! Connection routing over a consistent hash ring
//!
//! Two interchangeable implementations of [`ConnectionRouter`]:
//! - [`LocalRouter`]: ring and connection map owned in-process
//! - [`DistributedRouter`]: ring and connection map owned by a shared
//!   coordination store, with a version-stamped local ring cache
//!
//! Callers (the transport layer, admin tooling) depend only on the trait.

pub mod distributed;
pub mod local;
pub mod refresh;
pub mod ring;

pub use distributed::DistributedRouter;
pub use local::LocalRouter;
pub use ring::{place, HashRing};

use crate::common::{validate_id, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

/// Role of a connected party. The prefix is part of the hashed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Service,
}

impl Role {
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::User => "user:",
            Role::Service => "service:",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Service => write!(f, "service"),
        }
    }
}

/// Connection identifier: role prefix plus caller-supplied id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(role: Role, id: &str) -> Result<Self> {
        validate_id(&role.to_string(), id)?;
        Ok(Self(format!("{}{}", role.prefix(), id)))
    }

    pub fn user(user_id: &str) -> Result<Self> {
        Self::new(Role::User, user_id)
    }

    pub fn service(service_id: &str) -> Result<Self> {
        Self::new(Role::Service, service_id)
    }

    /// Parse a full identifier such as `user:42`.
    pub fn parse(raw: &str) -> Result<Self> {
        for role in [Role::User, Role::Service] {
            if let Some(id) = raw.strip_prefix(role.prefix()) {
                return Self::new(role, id);
            }
        }
        Err(crate::Error::InvalidInput(format!(
            "connection id must start with `user:` or `service:`: {}",
            raw
        )))
    }

    pub fn role(&self) -> Role {
        if self.0.starts_with(Role::Service.prefix()) {
            Role::Service
        } else {
            Role::User
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability both routers provide to the transport layer and admin tools.
///
/// Lookups report "no server" as `Ok(None)`; only malformed identifiers are
/// errors. Topology changes return the connection ids that must migrate.
#[async_trait]
pub trait ConnectionRouter: Send + Sync {
    /// Resolve a full connection id and record its assignment.
    async fn resolve(&self, connection: &ConnectionId) -> Option<String>;

    /// Forget a connection. Returns the server it was assigned to.
    async fn drop_connection(&self, connection: &ConnectionId) -> Option<String>;

    async fn add_server(&self, server: &str) -> Result<Vec<String>>;

    async fn remove_server(&self, server: &str) -> Result<Vec<String>>;

    async fn all_servers(&self) -> BTreeSet<String>;

    async fn connections_on_server(&self, server: &str) -> BTreeSet<String>;

    async fn all_connections(&self) -> BTreeMap<String, BTreeSet<String>>;

    /// Ordered `(position, server)` view of the ring this router routes with.
    async fn ring_snapshot(&self) -> Vec<(u64, String)>;

    async fn add_user(&self, user_id: &str) -> Result<Option<String>> {
        let connection = ConnectionId::user(user_id)?;
        Ok(self.resolve(&connection).await)
    }

    async fn add_service(&self, service_id: &str) -> Result<Option<String>> {
        let connection = ConnectionId::service(service_id)?;
        Ok(self.resolve(&connection).await)
    }

    async fn server_for_user(&self, user_id: &str) -> Result<Option<String>> {
        let connection = ConnectionId::user(user_id)?;
        Ok(self.resolve(&connection).await)
    }

    async fn server_for_service(&self, service_id: &str) -> Result<Option<String>> {
        let connection = ConnectionId::service(service_id)?;
        Ok(self.resolve(&connection).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_format() {
        assert_eq!(ConnectionId::user("42").unwrap().as_str(), "user:42");
        assert_eq!(ConnectionId::service("42").unwrap().as_str(), "service:42");
        assert!(ConnectionId::user("").is_err());
    }

    #[test]
    fn test_connection_id_parse() {
        let id = ConnectionId::parse("service:desk-7").unwrap();
        assert_eq!(id.role(), Role::Service);
        assert_eq!(id.to_string(), "service:desk-7");
        assert_eq!(ConnectionId::parse("user:1").unwrap().role(), Role::User);
        assert!(ConnectionId::parse("agent:1").is_err());
        assert!(ConnectionId::parse("user:").is_err());
    }
}
