//! Common utilities and types shared across ringroute

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{Config, RouterConfig, RouterMode};
pub use error::{Error, Result};
pub use hash::{
    blake3_position, default_hasher, server_from_token, vnode_token, Blake3KeyHasher, KeyHasher,
    SharedHasher,
};
pub use metrics::RouterMetrics;
pub use utils::{parse_duration, timestamp_now_millis, validate_id};
