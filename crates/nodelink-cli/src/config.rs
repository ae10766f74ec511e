//! Configuration loading: `~/.nodelink/config.toml` with defaults for
//! everything missing.

use nodelink_types::config::NodeConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// NodeLink home directory.
pub fn nodelink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".nodelink")
}

pub fn default_config_path() -> PathBuf {
    nodelink_home().join("config.toml")
}

/// Load the config at `path` (or the default path). A missing or broken file
/// yields the defaults.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Render `config` as it would be written to disk.
pub fn render_config(config: &NodeConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.log_level, "info");
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
subjects = ["telemetry"]

[protocol]
max_send_retries = 7

[tcp]
listen_addr = "0.0.0.0:4600"
advertise_host = "node1.lan"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.subjects, vec!["telemetry"]);
        assert_eq!(config.protocol.max_send_retries, 7);
        assert_eq!(config.protocol.max_missed_keep_alive_signals, 3);
        assert_eq!(config.tcp.listen_addr, "0.0.0.0:4600");
        assert_eq!(config.tcp.advertise_host.as_deref(), Some("node1.lan"));
    }

    #[test]
    fn test_broken_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "subjects = [unterminated").unwrap();
        assert_eq!(load_config(Some(&path)).subjects, vec!["default"]);
    }

    #[test]
    fn test_rendered_default_parses_back() {
        let rendered = render_config(&NodeConfig::default()).unwrap();
        let parsed: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.protocol, NodeConfig::default().protocol);
    }
}
