//! Configuration loading for the `gk` binary.
//!
//! Settings come from `{data_dir}/config.toml`, then `GATEKEEP_HOST` and
//! `GATEKEEP_PORT` override the server binding. A missing or unreadable file
//! is not an error: the engine runs on defaults and says so in the log.

use std::path::{Path, PathBuf};

use gatekeep_types::config::GlobalConfig;

const CONFIG_FILE: &str = "config.toml";

/// Data directory: `GATEKEEP_DATA_DIR`, else `~/.gatekeep`, else `./.gatekeep`.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var_os("GATEKEEP_DATA_DIR")
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".gatekeep")))
        .unwrap_or_else(|| PathBuf::from(".gatekeep"))
}

/// Load `{data_dir}/config.toml` and apply environment overrides.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let path = data_dir.join(CONFIG_FILE);
    let config = read_config_file(&path).await.unwrap_or_default();
    apply_env_overrides(config, |key| std::env::var(key).ok())
}

async fn read_config_file(path: &Path) -> Option<GlobalConfig> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return None;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config file unreadable, using defaults");
            return None;
        }
    };

    toml::from_str(&content)
        .inspect_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "config file invalid, using defaults");
        })
        .ok()
}

/// Apply `GATEKEEP_HOST` / `GATEKEEP_PORT` from `lookup`.
///
/// An unparsable port is ignored with a warning.
pub fn apply_env_overrides(
    mut config: GlobalConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> GlobalConfig {
    if let Some(host) = lookup("GATEKEEP_HOST").filter(|h| !h.trim().is_empty()) {
        config.server.host = host;
    }
    if let Some(port) = lookup("GATEKEEP_PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => tracing::warn!(value = %port, "GATEKEEP_PORT is not a port number, ignoring"),
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = read_config_file(&tmp.path().join(CONFIG_FILE)).await;
        assert!(config.is_none());

        let config = apply_env_overrides(config.unwrap_or_default(), no_env);
        assert_eq!(config.hub.max_connections_per_user, 10);
        assert!(config.engine.continue_on_optional_rejection);
    }

    #[tokio::test]
    async fn test_sections_parsed_and_defaults_filled() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            r#"
[engine]
continue_on_optional_rejection = false
sweep_interval_secs = 60

[server]
port = 9090
"#,
        )
        .await
        .unwrap();

        let config = read_config_file(&path).await.unwrap();
        assert!(!config.engine.continue_on_optional_rejection);
        assert_eq!(config.engine.sweep_interval_secs, 60);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.hub.channel_capacity, 64);
    }

    #[tokio::test]
    async fn test_invalid_file_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[engine\nsweep_interval_secs = ").await.unwrap();

        assert!(read_config_file(&path).await.is_none());
    }

    #[test]
    fn test_env_overrides_server_binding() {
        let config = apply_env_overrides(GlobalConfig::default(), |key| match key {
            "GATEKEEP_HOST" => Some("0.0.0.0".to_string()),
            "GATEKEEP_PORT" => Some("7000".to_string()),
            _ => None,
        });
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_bad_port_override_keeps_configured_port() {
        let mut base = GlobalConfig::default();
        base.server.port = 9090;
        let config = apply_env_overrides(base, |key| {
            (key == "GATEKEEP_PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_blank_host_override_ignored() {
        let config = apply_env_overrides(GlobalConfig::default(), |key| {
            (key == "GATEKEEP_HOST").then(|| "  ".to_string())
        });
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
