//! Global configuration types for Gatekeep.
//!
//! `GlobalConfig` represents the top-level `config.toml` controlling engine
//! policy, the notification hub, and the HTTP server.

use serde::{Deserialize, Serialize};

/// Top-level configuration. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Policy knobs of the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When a non-required step is rejected, continue with the next step
    /// instead of cancelling the instance.
    #[serde(default = "default_true")]
    pub continue_on_optional_rejection: bool,

    /// Seconds between expiry sweeps run by the server (0 disables the sweep).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum number of approval requests returned by a list query.
    #[serde(default = "default_max_list_limit")]
    pub max_list_limit: u32,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_max_list_limit() -> u32 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            continue_on_optional_rejection: default_true(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_list_limit: default_max_list_limit(),
        }
    }
}

/// Notification hub limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Live connections kept per user; the oldest are evicted beyond this.
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,

    /// Frames buffered per connection before a slow client is evicted.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_max_connections_per_user() -> usize {
    10
}

fn default_channel_capacity() -> usize {
    64
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: default_max_connections_per_user(),
            channel_capacity: default_channel_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_default_values() {
        let config = GlobalConfig::default();
        assert!(config.engine.continue_on_optional_rejection);
        assert_eq!(config.engine.sweep_interval_secs, 300);
        assert_eq!(config.hub.max_connections_per_user, 10);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_global_config_deserialize_empty() {
        let config: GlobalConfig = toml::from_str("").unwrap();
        assert_eq!(config.hub.heartbeat_interval_secs, 30);
        assert_eq!(config.engine.max_list_limit, 200);
    }

    #[test]
    fn test_global_config_deserialize_partial() {
        let toml_str = r#"
[engine]
continue_on_optional_rejection = false

[hub]
max_connections_per_user = 3
"#;
        let config: GlobalConfig = toml::from_str(toml_str).unwrap();
        assert!(!config.engine.continue_on_optional_rejection);
        assert_eq!(config.engine.sweep_interval_secs, 300);
        assert_eq!(config.hub.max_connections_per_user, 3);
        assert_eq!(config.hub.channel_capacity, 64);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
