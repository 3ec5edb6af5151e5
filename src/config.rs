//! Process configuration loaded from the environment. Never panics when
//! optional settings are absent — a node without a signing key still serves
//! every read path and most write paths; the absence just disables the
//! signatures that key would have produced.

use crate::crypto::{CryptoError, NodeKeySource};
use ed25519_dalek::SigningKey;
use std::env;
use std::path::PathBuf;

/// Default `policy.rate_limit_per_min` applied when a village's policy
/// doesn't set one.
pub const DEFAULT_RATE_LIMIT_PER_MIN: u32 = 60;

/// Runtime configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory under which `villages/` and `store/` are laid out.
    pub data_root: PathBuf,
    /// Where the node's own signing key is sourced from.
    pub key_source: NodeKeySource,
    /// Fallback rate limit used when a village policy omits one.
    pub default_rate_limit_per_min: u32,
}

impl NodeConfig {
    /// Loads configuration from the environment:
    /// - `VILLAGE_TRUST_DATA_ROOT` (default `.`)
    /// - `VILLAGE_TRUST_NODE_KEY` / `VILLAGE_TRUST_NODE_KEY_FILE` (see
    ///   [`NodeKeySource::from_env`])
    /// - `VILLAGE_TRUST_DEFAULT_RATE_LIMIT` (default 60)
    pub fn from_env() -> Self {
        let data_root = env::var("VILLAGE_TRUST_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let default_rate_limit_per_min = env::var("VILLAGE_TRUST_DEFAULT_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_PER_MIN);
        Self {
            data_root,
            key_source: NodeKeySource::from_env(),
            default_rate_limit_per_min,
        }
    }

    /// Loads the node's signing key, if configured.
    pub fn load_node_key(&self) -> Result<Option<SigningKey>, CryptoError> {
        self.key_source.load()
    }
}

/// Installs a `tracing-subscriber` `fmt` layer reading its filter from
/// `RUST_LOG` (defaulting to `info`). Safe to call more than once; later
/// calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        env::remove_var("VILLAGE_TRUST_DATA_ROOT");
        env::remove_var("VILLAGE_TRUST_NODE_KEY");
        env::remove_var("VILLAGE_TRUST_NODE_KEY_FILE");
        env::remove_var("VILLAGE_TRUST_DEFAULT_RATE_LIMIT");
        let cfg = NodeConfig::from_env();
        assert_eq!(cfg.data_root, PathBuf::from("."));
        assert_eq!(cfg.default_rate_limit_per_min, DEFAULT_RATE_LIMIT_PER_MIN);
        assert!(cfg.load_node_key().unwrap().is_none());
    }
}
