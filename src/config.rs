//! Daemon configuration.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the TCP listener binds to.
    pub bind: SocketAddr,
    /// This node's identity, stamped into every tick it mints.
    pub server: u32,
    /// Where node documents are persisted. `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
    /// Optional address to serve Prometheus metrics on.
    pub metrics_addr: Option<SocketAddr>,
    /// Per-connection tunables.
    pub connection: ConnectionConfig,
    /// Peers to dial at startup.
    pub peers: Vec<PeerConfig>,
    /// Tenants this node knows about, by name.
    pub tenants: BTreeMap<String, TenantConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:4040".parse().expect("valid default bind"),
            server: 0,
            data_dir: None,
            metrics_addr: None,
            connection: ConnectionConfig::default(),
            peers: Vec::new(),
            tenants: BTreeMap::new(),
        }
    }
}

/// Tunables shared by every connection of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds of send-side silence before a version packet is emitted.
    pub heartbeat_secs: u64,
    /// Capacity of the outbound packet ring.
    pub send_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 5,
            send_queue: 256,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// An outbound peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Address to dial.
    pub addr: SocketAddr,
    /// Seconds of inactivity before the watchdog re-dials. Absent means no
    /// reconnection: the connection dies with its socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_secs: Option<u64>,
}

impl PeerConfig {
    pub fn reconnect(&self) -> Option<Duration> {
        self.reconnect_secs.map(Duration::from_secs)
    }
}

/// One tenant's local configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Local root of the tenant's subtree.
    pub path: PathBuf,
    /// Whether this node mirrors the tenant's content.
    #[serde(default = "default_subscribe")]
    pub subscribe: bool,
}

fn default_subscribe() -> bool {
    true
}

impl Config {
    /// Load a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            bind = "127.0.0.1:5050"
            server = 3

            [tenants.docs]
            path = "/srv/docs"

            [[peers]]
            addr = "10.0.0.2:4040"
            reconnect_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.server, 3);
        assert_eq!(config.connection.heartbeat_secs, 5);
        assert_eq!(config.connection.send_queue, 256);
        assert!(config.tenants["docs"].subscribe);
        assert_eq!(
            config.peers[0].reconnect(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn empty_config_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.peers.is_empty());
        assert!(config.tenants.is_empty());
        assert!(config.data_dir.is_none());
    }
}
