//! Configuration for ringroute components

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file looked up by [`Config::load`] (extension optional).
pub const DEFAULT_CONFIG_FILE: &str = "ringroute";

/// Environment variable prefix, e.g. `RINGROUTE_ROUTER__VIRTUAL_NODES=200`.
pub const ENV_PREFIX: &str = "RINGROUTE";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Router settings
    #[serde(default)]
    pub router: RouterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Which router implementation backs the contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterMode {
    /// In-process ring and connection map
    #[default]
    Local,
    /// Ring and connection map live in the coordination store
    Distributed,
}

impl std::fmt::Display for RouterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterMode::Local => write!(f, "local"),
            RouterMode::Distributed => write!(f, "distributed"),
        }
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub mode: RouterMode,

    /// Virtual nodes placed per server
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Delay before the first background staleness check
    #[serde(default = "default_refresh_initial_delay")]
    pub refresh_initial_delay_ms: u64,

    /// Interval between background staleness checks
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Upper bound for a single coordination store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// How long shutdown waits for the refresh task before aborting it
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Optional prefix applied to every coordination store key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

fn default_virtual_nodes() -> usize {
    150
}
fn default_refresh_initial_delay() -> u64 {
    5_000
}
fn default_refresh_interval() -> u64 {
    10_000
}
fn default_store_timeout() -> u64 {
    2_000
}
fn default_shutdown_grace() -> u64 {
    5_000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::default(),
            virtual_nodes: default_virtual_nodes(),
            refresh_initial_delay_ms: default_refresh_initial_delay(),
            refresh_interval_ms: default_refresh_interval(),
            store_timeout_ms: default_store_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            namespace: None,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.virtual_nodes == 0 {
            return Err(crate::Error::InvalidConfig(
                "virtual_nodes must be greater than zero".into(),
            ));
        }
        if self.refresh_interval_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "refresh_interval_ms must be greater than zero".into(),
            ));
        }
        if let Some(ns) = &self.namespace {
            if ns.trim().is_empty() {
                return Err(crate::Error::InvalidConfig(
                    "namespace must not be blank".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn refresh_initial_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_initial_delay_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load defaults, then `ringroute.toml` if present, then `RINGROUTE_*` env vars.
    pub fn load() -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.router.validate()?;
        Ok(config)
    }

    /// Load a single config file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.router.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.mode, RouterMode::Local);
        assert_eq!(cfg.virtual_nodes, 150);
        assert_eq!(cfg.refresh_initial_delay(), Duration::from_secs(5));
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_vnodes() {
        let cfg = RouterConfig {
            virtual_nodes: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(crate::Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[router]\nmode = \"distributed\"\nvirtual_nodes = 32\nnamespace = \"im\""
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.router.mode, RouterMode::Distributed);
        assert_eq!(cfg.router.virtual_nodes, 32);
        assert_eq!(cfg.router.refresh_interval_ms, 10_000);
        assert_eq!(cfg.router.namespace.as_deref(), Some("im"));
    }

    #[test]
    fn test_from_file_invalid() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[router]\nrefresh_interval_ms = 0").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }
}
