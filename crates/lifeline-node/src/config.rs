//! Node configuration from `LIFELINE_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lifeline_mesh::ConnectionCode;
use thiserror::Error;

pub const DEFAULT_DATA_DIR: &str = "./lifeline-data";
pub const DEFAULT_P2P_ADDR: &str = "0.0.0.0:9400";
pub const DEFAULT_USER_NAME: &str = "User";
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: invalid socket address {value:?}")]
    InvalidAddr { var: &'static str, value: String },

    #[error("{var}: expected a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("LIFELINE_PEERS: {0}")]
    InvalidPeer(String),
}

/// Configuration for a Lifeline node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Snapshot file and default admin socket live here
    pub data_dir: PathBuf,

    /// P2P listen address
    pub p2p_addr: SocketAddr,

    /// Address put in our connection code, if not the listen address
    pub advertise_addr: Option<SocketAddr>,

    /// Stable peer id; generated when absent
    pub peer_id: Option<String>,

    /// Display name in handshakes, broadcasts and escalations
    pub user_name: String,

    /// Peers dialed at boot
    pub peers: Vec<ConnectionCode>,

    /// Admin socket path (for lifeline-admin)
    pub admin_socket: PathBuf,

    /// How often a dirty snapshot is flushed
    pub snapshot_interval: Duration,
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = PathBuf::from(var("LIFELINE_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));

        let p2p_addr = parse_addr(
            "LIFELINE_P2P_ADDR",
            var("LIFELINE_P2P_ADDR").unwrap_or_else(|| DEFAULT_P2P_ADDR.to_string()),
        )?;

        let advertise_addr = var("LIFELINE_ADVERTISE_ADDR")
            .map(|v| parse_addr("LIFELINE_ADVERTISE_ADDR", v))
            .transpose()?;

        let peers = match var("LIFELINE_PEERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| ConnectionCode::parse_route(p).map_err(|e| ConfigError::InvalidPeer(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let admin_socket = var("LIFELINE_ADMIN_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("admin.sock"));

        let snapshot_secs = match var("LIFELINE_SNAPSHOT_INTERVAL_SECS") {
            Some(v) => v
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidNumber {
                    var: "LIFELINE_SNAPSHOT_INTERVAL_SECS",
                    value: v,
                })?,
            None => DEFAULT_SNAPSHOT_INTERVAL_SECS,
        };

        Ok(Self {
            data_dir,
            p2p_addr,
            advertise_addr,
            peer_id: var("LIFELINE_PEER_ID"),
            user_name: var("LIFELINE_USER_NAME").unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
            peers,
            admin_socket,
            snapshot_interval: Duration::from_secs(snapshot_secs),
        })
    }
}

fn parse_addr(var: &'static str, value: String) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidAddr { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./lifeline-data"));
        assert_eq!(config.p2p_addr, "0.0.0.0:9400".parse().unwrap());
        assert_eq!(config.admin_socket, PathBuf::from("./lifeline-data/admin.sock"));
        assert_eq!(config.user_name, "User");
        assert_eq!(config.snapshot_interval, Duration::from_secs(5));
        assert!(config.peer_id.is_none());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            ("LIFELINE_DATA_DIR", "/var/lib/lifeline"),
            ("LIFELINE_P2P_ADDR", "127.0.0.1:7000"),
            ("LIFELINE_PEER_ID", "  alice "),
            ("LIFELINE_USER_NAME", "Alice"),
            ("LIFELINE_PEERS", "bob@10.0.0.2:9400, carol@10.0.0.3:9400,"),
            ("LIFELINE_SNAPSHOT_INTERVAL_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.admin_socket, PathBuf::from("/var/lib/lifeline/admin.sock"));
        assert_eq!(config.peer_id.as_deref(), Some("alice"));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].peer_id, "carol");
        assert_eq!(config.snapshot_interval, Duration::from_secs(30));
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(matches!(
            config_from(&[("LIFELINE_P2P_ADDR", "nowhere")]),
            Err(ConfigError::InvalidAddr { .. })
        ));
        assert!(matches!(
            config_from(&[("LIFELINE_PEERS", "bob")]),
            Err(ConfigError::InvalidPeer(_))
        ));
        assert!(matches!(
            config_from(&[("LIFELINE_SNAPSHOT_INTERVAL_SECS", "0")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            config_from(&[("LIFELINE_SNAPSHOT_INTERVAL_SECS", "soon")]),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
