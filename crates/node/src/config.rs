//! Node configuration, loaded from TOML with serde defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory holding the ledger database.
    pub data_path: PathBuf,
    /// TCP port the bootstrap listener binds.
    pub bootstrap_port: u16,
    /// Peers contacted for the initial bootstrap rounds.
    pub preconfigured_peers: Vec<SocketAddr>,
    /// Election worker threads.
    pub election_workers: usize,
    /// Fraction of the online weight required for confirmation, in percent.
    pub quorum_percent: u32,
    /// Wall-clock bound on a single election, seconds.
    pub election_timeout_secs: u64,
    /// Minimum spacing between reconfirmations of one (account, height).
    pub reconfirm_interval_secs: u64,
    /// Outbound callback sink toggle.
    pub callback_enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_path: PathBuf::from("."),
            bootstrap_port: 7175,
            preconfigured_peers: Vec::new(),
            election_workers: 4,
            quorum_percent: 67,
            election_timeout_secs: 300,
            reconfirm_interval_secs: 15,
            callback_enabled: false,
        }
    }
}

impl NodeConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_path.join("ledger.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = NodeConfig::default();
        assert!(config.election_workers >= 1);
        assert!(config.quorum_percent > 50 && config.quorum_percent <= 100);
    }
}
