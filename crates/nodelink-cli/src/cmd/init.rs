//! `nodelink init`: write a starting config.

use crate::cmd::config::backup_existing_config;
use crate::config::{default_config_path, render_config};
use crate::ui;
use nodelink_types::config::NodeConfig;
use std::path::{Path, PathBuf};

pub fn cmd_init(config_path: Option<PathBuf>, force: bool) {
    let path = config_path.unwrap_or_else(default_config_path);
    if let Err(e) = write_initial_config(&path, force) {
        ui::error_with_fix(
            &format!("Failed to write {}", path.display()),
            "Check permissions on the config directory",
        );
        eprintln!("  {e}");
        std::process::exit(1);
    }
}

fn write_initial_config(path: &Path, force: bool) -> std::io::Result<()> {
    if path.exists() && !force {
        ui::kv_warn("Config", &format!("{} already exists", path.display()));
        ui::hint("Use --force to replace it (the old file is backed up)");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(backup) = backup_existing_config(path)? {
        ui::kv("Backup", &backup.display().to_string());
    }

    let config = initial_config();
    let rendered = render_config(&config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, rendered)?;

    ui::success("NodeLink initialized");
    ui::kv("Config", &path.display().to_string());
    if let Some(id) = config.node_id {
        ui::kv("Endpoint", &id.to_string());
    }
    ui::kv("Machine", &config.resolved_machine_name());
    ui::blank();
    ui::next_steps(&[
        "Add peers under [[peers]] in the config",
        "Start the node:  nodelink run",
    ]);
    Ok(())
}

/// Defaults with a fixed identity so peers can list this node.
fn initial_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node_id = Some(uuid::Uuid::new_v4());
    config.machine_name = Some(config.resolved_machine_name());
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    #[test]
    fn test_init_writes_loadable_config_with_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_initial_config(&path, false).unwrap();

        let config = load_config(Some(&path));
        assert!(config.node_id.is_some());
        assert!(config.machine_name.is_some());
    }

    #[test]
    fn test_init_keeps_existing_config_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = \"trace\"").unwrap();

        write_initial_config(&path, false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "log_level = \"trace\""
        );

        write_initial_config(&path, true).unwrap();
        assert!(load_config(Some(&path)).node_id.is_some());
    }
}
