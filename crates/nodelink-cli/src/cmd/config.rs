//! Config inspection commands.

use crate::config::{default_config_path, load_config, render_config};
use crate::ui;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Rename the existing config.toml to a timestamped backup before writing a new one.
pub(crate) fn backup_existing_config(config_path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !config_path.exists() {
        return Ok(None);
    }

    let file_name = config_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("config.toml");
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let backup_name = format!("{file_name}.backup-{timestamp}");
    let backup_path = config_path.with_file_name(&backup_name);

    std::fs::rename(config_path, &backup_path)?;
    Ok(Some(backup_path))
}

pub fn cmd_config_show(config_path: Option<PathBuf>) {
    let config = load_config(config_path.as_deref());
    match render_config(&config) {
        Ok(rendered) => print!("{rendered}"),
        Err(e) => {
            ui::error(&format!("Failed to render config: {e}"));
            std::process::exit(1);
        }
    }
}

pub fn cmd_config_path(config_path: Option<PathBuf>) {
    let path = config_path.unwrap_or_else(default_config_path);
    println!("{}", path.display());
    if !path.exists() {
        ui::hint("The file does not exist yet; run `nodelink init` to create it");
    }
}
