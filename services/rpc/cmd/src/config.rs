//! Configuration handling for the rpc node.
//!
//! Settings come from the `node` section of a YAML file, then environment
//! variables override individual values.

use anyhow::Result;
use rpc_session::{ChannelConfig, StaticAuthenticator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address `serve` listens on
    pub listen: SocketAddr,
    /// Address `call` connects to
    pub connect: SocketAddr,
    /// Accepted logins; empty means no authentication
    pub users: HashMap<String, String>,
    /// Channel settings for both roles
    pub channel: ChannelConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9400)),
            connect: SocketAddr::from(([127, 0, 0, 1], 9400)),
            users: HashMap::new(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    node: Option<NodeConfig>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.node.unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.channel.validate()?;

        info!(
            "Node configuration: listen={}, connect={}, service={}/{}, segment={}",
            config.listen,
            config.connect,
            config.channel.domain,
            config.channel.service_name,
            config.channel.max_segment_size
        );
        Ok(config)
    }

    /// Authenticator for the configured users, if any
    pub fn authenticator(&self) -> Option<StaticAuthenticator> {
        if self.users.is_empty() {
            return None;
        }
        let table = self
            .users
            .iter()
            .fold(StaticAuthenticator::new(), |table, (user, password)| {
                table.with_user(user.clone(), password.clone())
            });
        Some(table)
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("RPC_LISTEN") {
            match value.parse() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid RPC_LISTEN '{}'", value),
            }
        }

        if let Some(value) = lookup("RPC_CONNECT") {
            match value.parse() {
                Ok(addr) => {
                    self.connect = addr;
                    info!("Connect address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid RPC_CONNECT '{}'", value),
            }
        }

        if let Some(value) = lookup("RPC_SERVICE_NAME") {
            info!("Service name overridden by environment: {}", value);
            self.channel.service_name = value;
        }

        if let Some(value) = lookup("RPC_DOMAIN") {
            info!("Domain overridden by environment: {}", value);
            self.channel.domain = value;
        }

        if let Some(value) = lookup("RPC_MAX_SEGMENT_SIZE") {
            match value.parse::<usize>() {
                Ok(size) => {
                    self.channel.max_segment_size = size;
                    info!("Max segment size overridden by environment: {}", size);
                }
                Err(_) => warn!("Ignoring invalid RPC_MAX_SEGMENT_SIZE '{}'", value),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_session::CodecKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen.port(), 9400);
        assert_eq!(config.channel.stream_window, 16);
        assert!(config.authenticator().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node:
  listen: 0.0.0.0:9500
  users:
    alice: secret
  channel:
    max_segment_size: 4096
    service_name: echo
    ping_interval_ms: 5000
    codec: json
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.listen.port(), 9500);
        assert_eq!(config.connect.port(), 9400);
        assert_eq!(config.channel.max_segment_size, 4096);
        assert_eq!(config.channel.service_name, "echo");
        assert_eq!(config.channel.domain, "default");
        assert_eq!(config.channel.codec, CodecKind::Json);
        assert_eq!(config.channel.ping_interval_ms, Some(5000));
        assert!(config.authenticator().is_some());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = NodeConfig::load_from_file("/nonexistent/rpc-node.yaml").unwrap();
        assert_eq!(config.channel.max_segment_size, ChannelConfig::default().max_segment_size);
    }

    #[test]
    fn test_invalid_channel_settings_rejected() {
        let yaml_content = "node:\n  channel:\n    stream_window: 0\n";
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("RPC_LISTEN", "0.0.0.0:7000"),
            ("RPC_CONNECT", "not an address"),
            ("RPC_SERVICE_NAME", "billing"),
            ("RPC_MAX_SEGMENT_SIZE", "1024"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.connect, NodeConfig::default().connect);
        assert_eq!(config.channel.service_name, "billing");
        assert_eq!(config.channel.domain, "default");
        assert_eq!(config.channel.max_segment_size, 1024);
    }
}
