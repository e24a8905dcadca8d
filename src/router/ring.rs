//! Consistent hash ring with virtual nodes
//!
//! Each server owns `virtual_nodes` positions on a 64-bit ring, derived from
//! `hash(server#index)`. A key belongs to the first position clockwise from
//! its own hash, wrapping past the largest position to the smallest.
//!
//! Two virtual nodes hashing to the exact same position are not special-cased:
//! the later insert wins that position. With 64-bit positions this is
//! vanishingly rare and accepted.

use crate::common::{vnode_token, Error, Result, SharedHasher};
use std::collections::{BTreeMap, BTreeSet};

/// Compute the virtual-node positions of `server`.
///
/// Pure function of its inputs, so every process that shares the hasher
/// derives the same ring.
pub fn place(hasher: &SharedHasher, server: &str, virtual_nodes: usize) -> Vec<(u64, String)> {
    (0..virtual_nodes)
        .map(|i| {
            let token = vnode_token(server, i);
            (hasher.hash(&token), token)
        })
        .collect()
}

/// Ordered map from ring position to owning server.
#[derive(Debug, Clone)]
pub struct HashRing {
    positions: BTreeMap<u64, String>,
    virtual_nodes: usize,
    hasher: SharedHasher,
}

impl HashRing {
    pub fn new(virtual_nodes: usize, hasher: SharedHasher) -> Self {
        Self {
            positions: BTreeMap::new(),
            virtual_nodes,
            hasher,
        }
    }

    /// Build a ring from already computed `(position, server)` entries.
    pub fn from_entries<I>(entries: I, virtual_nodes: usize, hasher: SharedHasher) -> Self
    where
        I: IntoIterator<Item = (u64, String)>,
    {
        Self {
            positions: entries.into_iter().collect(),
            virtual_nodes,
            hasher,
        }
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Number of positions on the ring
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// A server is present iff it owns at least one position.
    pub fn contains_server(&self, server: &str) -> bool {
        self.positions.values().any(|s| s == server)
    }

    /// Distinct servers owning positions
    pub fn servers(&self) -> BTreeSet<String> {
        self.positions.values().cloned().collect()
    }

    /// Positions owned by `server`, ascending
    pub fn positions_of(&self, server: &str) -> Vec<u64> {
        self.positions
            .iter()
            .filter(|(_, s)| s.as_str() == server)
            .map(|(pos, _)| *pos)
            .collect()
    }

    /// Ordered `(position, server)` view of the ring
    pub fn entries(&self) -> impl Iterator<Item = (u64, &str)> {
        self.positions.iter().map(|(pos, s)| (*pos, s.as_str()))
    }

    /// Insert the virtual nodes of `server`. Returns the number of positions written.
    pub fn add_server(&mut self, server: &str) -> usize {
        let placed = place(&self.hasher, server, self.virtual_nodes);
        let count = placed.len();
        for (pos, _) in placed {
            self.positions.insert(pos, server.to_string());
        }
        count
    }

    /// Delete every position owned by `server`. Returns the removed positions.
    pub fn remove_server(&mut self, server: &str) -> Vec<u64> {
        let removed = self.positions_of(server);
        for pos in &removed {
            self.positions.remove(pos);
        }
        removed
    }

    /// Owner of an arbitrary ring position.
    pub fn locate(&self, position: u64) -> Result<&str> {
        self.positions
            .range(position..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, server)| server.as_str())
            .ok_or(Error::EmptyRing)
    }

    /// Owner of `key`.
    pub fn lookup(&self, key: &str) -> Result<&str> {
        self.locate(self.hasher.hash(key))
    }
}
