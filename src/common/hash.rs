//! Hashing utilities for ringroute
//!
//! - BLAKE3 for ring positions (stable across processes and platforms)
//! - Virtual-node token encoding (`server#index`)

use std::sync::Arc;

/// Separator between a server id and its virtual-node index.
pub const VNODE_SEPARATOR: char = '#';

/// Maps a string key to a 64-bit ring position.
///
/// Implementations must be pure: the same key yields the same position in
/// every process, otherwise independent router instances disagree on owners.
pub trait KeyHasher: Send + Sync + std::fmt::Debug {
    fn hash(&self, key: &str) -> u64;

    /// Label recorded in the coordination store config.
    fn label(&self) -> &'static str;
}

/// Default hasher: first 8 bytes of BLAKE3(key), little-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3KeyHasher;

impl KeyHasher for Blake3KeyHasher {
    fn hash(&self, key: &str) -> u64 {
        blake3_position(key)
    }

    fn label(&self) -> &'static str {
        "blake3"
    }
}

/// Shared handle to a hasher.
pub type SharedHasher = Arc<dyn KeyHasher>;

/// Default shared hasher.
pub fn default_hasher() -> SharedHasher {
    Arc::new(Blake3KeyHasher)
}

/// Compute the ring position of a key with BLAKE3
pub fn blake3_position(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Token naming the `index`-th virtual node of `server`.
pub fn vnode_token(server: &str, index: usize) -> String {
    format!("{}{}{}", server, VNODE_SEPARATOR, index)
}

/// Recover the owning server from a virtual-node token.
///
/// Only the last `#index` suffix is stripped, so server ids containing `#`
/// round-trip. Tokens without a numeric suffix are returned unchanged.
pub fn server_from_token(token: &str) -> &str {
    match token.rsplit_once(VNODE_SEPARATOR) {
        Some((server, index)) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            server
        }
        _ => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_position_deterministic() {
        assert_eq!(blake3_position("user:42"), blake3_position("user:42"));
        assert_ne!(blake3_position("user:42"), blake3_position("service:42"));
    }

    #[test]
    fn test_hasher_label() {
        assert_eq!(Blake3KeyHasher.label(), "blake3");
        assert_eq!(default_hasher().hash("node1#0"), blake3_position("node1#0"));
    }

    #[test]
    fn test_vnode_token_roundtrip() {
        let token = vnode_token("node1", 17);
        assert_eq!(token, "node1#17");
        assert_eq!(server_from_token(&token), "node1");
    }

    #[test]
    fn test_server_with_separator() {
        let token = vnode_token("rack#2/node", 3);
        assert_eq!(server_from_token(&token), "rack#2/node");
        assert_eq!(server_from_token("plain"), "plain");
        assert_eq!(server_from_token("odd#tail"), "odd#tail");
    }
}
