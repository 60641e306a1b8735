use anyhow::Context;
use std::path::{Path, PathBuf};

// Linux: /home/<user>/.config/resolverd/
// OSX: /Users/<user>/Library/Preferences/resolverd/
fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "resolverd")
        .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    config_dir()
        .map(|dir| Path::join(&dir, "config.toml"))
        .context("Could not generate default configuration path")
}

/// This is to store the DB
// Linux: /home/<user>/.local/share/resolverd/
// OSX: /Users/<user>/Library/Application Support/resolverd/
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "resolverd")
        .map(|proj_dirs| proj_dirs.data_dir().to_path_buf())
}

pub fn ensure_directory_exists(dir: &Path) -> Result<(), std::io::Error> {
    if !dir.exists() {
        tracing::info!(
            "Data directory does not exist, creating recursively: {}",
            dir.display()
        );
        return std::fs::create_dir_all(dir);
    }

    Ok(())
}
