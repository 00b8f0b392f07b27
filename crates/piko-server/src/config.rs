//! Server configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub admin: AdminConfig,
    pub gossip: GossipConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node ID. Generated with a `piko-` prefix when unset.
    pub id: Option<String>,
}

/// The listener clients send proxied requests to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_addr: String,
    /// Address peers use to forward requests to this node. Defaults to the
    /// bound address.
    pub advertise_addr: Option<String>,
    /// Maximum time to wait for an upstream response before answering 504.
    pub gateway_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            advertise_addr: None,
            gateway_timeout_ms: 15_000,
        }
    }
}

/// The listener upstream agents dial into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub bind_addr: String,
    /// Interval between server-side heartbeats on each agent stream.
    pub heartbeat_interval_ms: u64,
    /// Per-heartbeat timeout; one miss tears the connection down.
    pub heartbeat_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8001".to_string(),
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub bind_addr: String,
    /// Address peers use to reach this node's admin API. Defaults to the
    /// bound address.
    pub advertise_addr: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8002".to_string(),
            advertise_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Admin addresses of existing cluster members to push state to.
    pub join: Vec<String>,
    /// Interval between full state exchanges with peers.
    pub sync_interval_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            join: Vec::new(),
            sync_interval_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML or JSON file, by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: Config = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: Config = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("unsupported config file extension: {}", ext),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.proxy.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.proxy.gateway_timeout_ms, 15_000);
        assert_eq!(config.upstream.bind_addr, "0.0.0.0:8001");
        assert_eq!(config.admin.bind_addr, "0.0.0.0:8002");
        assert!(config.gossip.join.is_empty());
        assert_eq!(config.log.level, "info");
        assert!(config.node.id.is_none());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            [node]
            id = "piko-test"

            [proxy]
            bind_addr = "127.0.0.1:9000"
            gateway_timeout_ms = 100

            [gossip]
            join = ["10.0.0.2:8002"]
            sync_interval_ms = 500
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.node.id.as_deref(), Some("piko-test"));
        assert_eq!(config.proxy.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.proxy.gateway_timeout_ms, 100);
        assert_eq!(config.gossip.join, vec!["10.0.0.2:8002"]);
        assert_eq!(config.gossip.sync_interval_ms, 500);
        // Unset sections keep their defaults.
        assert_eq!(config.upstream.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"admin": {{"bind_addr": "127.0.0.1:9002"}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.admin.bind_addr, "127.0.0.1:9002");
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "proxy:").unwrap();

        assert!(Config::from_file(file.path()).is_err());
    }
}
