//! Configuration management for the chat node.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::network::{OverflowPolicy, PeerAddress};
use crate::utils::{ConfigError, Result};
use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "p2p-chat.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "P2P_CHAT";

/// Complete configuration for the chat node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Discovery configuration
    pub discovery: DiscoveryConfig,
    /// Chat and liveness probe configuration
    pub chat: ChatConfig,
    /// Identity configuration
    pub identity: IdentityConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Multiaddresses to listen on
    pub listen_addresses: Vec<String>,
    /// Timeout for a single connect / stream-open attempt in seconds
    pub connect_timeout: u64,
    /// How long an idle connection is kept open in seconds
    pub idle_connection_timeout: u64,
}

/// Peer discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Rendezvous topic shared by every node that should find each other
    pub topic: String,
    /// Enable Kademlia DHT rendezvous
    pub enable_dht: bool,
    /// Enable mDNS discovery on the local network
    pub enable_mdns: bool,
    /// Seed peers for the DHT (empty = public libp2p bootstrap nodes)
    pub bootstrap_nodes: Vec<String>,
    /// DHT bootstrap timeout in seconds
    pub bootstrap_timeout: u64,
    /// Delay after bootstrap before lookups, in milliseconds
    pub settle_delay_ms: u64,
    /// Interval between repeated provider lookups in seconds
    pub rediscovery_interval: u64,
    /// Interval at which provider records are republished in seconds
    pub provider_publication_interval: u64,
    /// Capacity of the discovered-peer queues
    pub queue_capacity: usize,
    /// What to drop when a discovered-peer queue is full
    pub overflow_policy: OverflowPolicy,
}

/// Chat and liveness probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Number of ping probes in direct-connect mode
    pub ping_count: usize,
    /// Interval between ping probes in seconds
    pub ping_interval: u64,
}

/// Identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Key file holding the node keypair (unset = `<data dir>/p2p-chat/node.key`)
    pub key_file: Option<PathBuf>,
    /// Ignore the default key file and use a fresh identity per run
    #[serde(default)]
    pub ephemeral: bool,
}

impl IdentityConfig {
    /// Default key file location, `<data dir>/p2p-chat/node.key`
    pub fn default_key_file() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("p2p-chat").join("node.key"))
    }

    /// Key file the identity commands read and write
    pub fn key_path(&self) -> Option<PathBuf> {
        self.key_file.clone().or_else(Self::default_key_file)
    }

    /// Key file a starting node uses, if any.
    ///
    /// A configured key file is always used and created on first use. The
    /// default one is only used if it already exists and the identity is not
    /// ephemeral; otherwise the node runs with a fresh identity.
    pub fn startup_key_file(&self) -> Option<PathBuf> {
        if self.key_file.is_some() {
            return self.key_file.clone();
        }
        if self.ephemeral {
            return None;
        }
        Self::default_key_file().filter(|path| path.exists())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![crate::defaults::DEFAULT_LISTEN_ADDRESS.to_string()],
            connect_timeout: crate::defaults::DEFAULT_CONNECT_TIMEOUT,
            idle_connection_timeout: 60,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            topic: crate::defaults::DEFAULT_TOPIC.to_string(),
            enable_dht: true,
            enable_mdns: true,
            bootstrap_nodes: Vec::new(),
            bootstrap_timeout: crate::defaults::DEFAULT_BOOTSTRAP_TIMEOUT,
            settle_delay_ms: 1000,
            rediscovery_interval: 30,
            provider_publication_interval: 12 * 60 * 60,
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            ping_count: crate::defaults::DEFAULT_PING_COUNT,
            ping_interval: 1,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl DiscoveryConfig {
    /// Bootstrap timeout as a [`Duration`]
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout)
    }

    /// Settle delay as a [`Duration`]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Rediscovery interval as a [`Duration`]
    pub fn rediscovery_interval(&self) -> Duration {
        Duration::from_secs(self.rediscovery_interval)
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit `config_file` must exist. Without one, `./p2p-chat.toml`
    /// and then `<config dir>/p2p-chat/p2p-chat.toml` are tried.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            config = config.merge(Self::from_file(path)?);
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("p2p-chat")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        // Whole-section replacement; a file always carries every section.
        self.network = other.network;
        self.discovery = other.discovery;
        self.chat = other.chat;
        self.identity = other.identity;
        self.logging = other.logging;
        self
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(listen) = std::env::var(format!("{ENV_PREFIX}_NETWORK_LISTEN")) {
            self.network.listen_addresses = listen
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(topic) = std::env::var(format!("{ENV_PREFIX}_DISCOVERY_TOPIC")) {
            self.discovery.topic = topic;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(key_file) = std::env::var(format!("{ENV_PREFIX}_IDENTITY_KEY_FILE")) {
            self.identity.key_file = Some(PathBuf::from(key_file));
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.network.listen_addresses.is_empty() {
            return Err(invalid("network.listen_addresses", "[]"));
        }

        for address in &self.network.listen_addresses {
            if address.parse::<Multiaddr>().is_err() {
                return Err(invalid("network.listen_addresses", address));
            }
        }

        if self.network.connect_timeout == 0 {
            return Err(invalid("network.connect_timeout", "0"));
        }

        if self.discovery.topic.trim().is_empty() {
            return Err(invalid("discovery.topic", &self.discovery.topic));
        }

        for seed in &self.discovery.bootstrap_nodes {
            if PeerAddress::parse(seed).is_err() {
                return Err(invalid("discovery.bootstrap_nodes", seed));
            }
        }

        if self.discovery.bootstrap_timeout == 0 {
            return Err(invalid("discovery.bootstrap_timeout", "0"));
        }

        if self.discovery.rediscovery_interval == 0 {
            return Err(invalid("discovery.rediscovery_interval", "0"));
        }

        if self.discovery.queue_capacity == 0 {
            return Err(invalid("discovery.queue_capacity", "0"));
        }

        if self.chat.ping_interval == 0 {
            return Err(invalid("chat.ping_interval", "0"));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::NodeError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.listen_addresses, vec!["/ip4/0.0.0.0/tcp/0"]);
        assert_eq!(config.discovery.topic, crate::defaults::DEFAULT_TOPIC);
        assert!(config.discovery.enable_dht);
        assert!(config.discovery.enable_mdns);
        assert!(config.identity.key_file.is_none());
        assert!(!config.identity.ephemeral);
        assert_eq!(config.discovery.settle_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_identity_key_file_resolution() {
        let configured = IdentityConfig {
            key_file: Some(PathBuf::from("/tmp/node.key")),
            ephemeral: true,
        };
        assert_eq!(configured.key_path(), configured.key_file);
        assert_eq!(configured.startup_key_file(), configured.key_file);

        let ephemeral = IdentityConfig {
            key_file: None,
            ephemeral: true,
        };
        assert!(ephemeral.startup_key_file().is_none());
        assert_eq!(ephemeral.key_path(), IdentityConfig::default_key_file());
    }

    #[test]
    fn test_identity_section_without_ephemeral_parses() {
        let mut config = NodeConfig::default();
        config.identity.key_file = Some(PathBuf::from("/tmp/node.key"));
        let toml_str = config.to_toml_string().unwrap().replace("ephemeral = false\n", "");
        assert!(!toml_str.contains("ephemeral"));

        let parsed: NodeConfig = toml::from_str(&toml_str).unwrap();
        assert!(!parsed.identity.ephemeral);
        assert_eq!(parsed.identity.key_file, config.identity.key_file);
    }

    #[test]
    fn test_config_serialization() {
        let config = NodeConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("listen_addresses"));
        assert!(toml_str.contains("enable_mdns"));
        assert!(toml_str.contains("overflow_policy = \"drop_oldest\""));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = NodeConfig::default();
        config.discovery.topic = "t".to_string();
        config.identity.key_file = Some(PathBuf::from("/tmp/node.key"));
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = NodeConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.discovery.topic, "t");
        assert_eq!(loaded.identity.key_file, config.identity.key_file);
        assert_eq!(loaded.network.connect_timeout, config.network.connect_timeout);
        assert_eq!(loaded.discovery.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_load_explicit_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(NodeConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig::default();
        assert!(config.validate().is_ok());

        config.network.listen_addresses = vec!["not a multiaddr".to_string()];
        assert!(config.validate().is_err());

        config = NodeConfig::default();
        config.discovery.topic = "  ".to_string();
        assert!(config.validate().is_err());

        config = NodeConfig::default();
        config.discovery.bootstrap_nodes = vec!["/ip4/127.0.0.1/tcp/4001".to_string()];
        assert!(config.validate().is_err(), "seed without peer id must be rejected");

        config = NodeConfig::default();
        config.discovery.queue_capacity = 0;
        assert!(config.validate().is_err());

        config = NodeConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_merge() {
        let config1 = NodeConfig::default();
        let mut config2 = NodeConfig::default();
        config2.discovery.topic = "other".to_string();

        let merged = config1.merge(config2);
        assert_eq!(merged.discovery.topic, "other");
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("P2P_CHAT_DISCOVERY_TOPIC", "from-env");
        std::env::set_var(
            "P2P_CHAT_NETWORK_LISTEN",
            "/ip4/127.0.0.1/tcp/0, /ip6/::1/tcp/0",
        );

        let config = NodeConfig::default().merge_from_env().unwrap();
        assert_eq!(config.discovery.topic, "from-env");
        assert_eq!(
            config.network.listen_addresses,
            vec!["/ip4/127.0.0.1/tcp/0", "/ip6/::1/tcp/0"]
        );

        std::env::remove_var("P2P_CHAT_DISCOVERY_TOPIC");
        std::env::remove_var("P2P_CHAT_NETWORK_LISTEN");
    }
}
