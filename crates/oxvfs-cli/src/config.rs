//! Configuration file support for the oxvfs CLI.
//!
//! Configuration is read from `~/.config/oxvfs/config.toml`, or from
//! `$OXVFS_CONFIG_DIR/config.toml` when that variable is set. Every value is
//! optional and command-line flags win.
//!
//! # Example configuration
//!
//! ```toml
//! [defaults]
//! lock_style = "posix"
//! pending_byte = 0x40000000
//! shared_size = 510
//! verbosity = 1
//! dir_sync = true
//! full_fsync = false
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use oxvfs_core::{LockLayout, LockStyleChoice, VfsConfig};

/// Overrides the directory holding `config.toml`.
pub const CONFIG_DIR_ENV: &str = "OXVFS_CONFIG_DIR";

/// Main configuration structure
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Default settings applied to all commands
    #[serde(default)]
    pub defaults: Defaults,
}

/// Default settings
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Defaults {
    /// Lock style (auto, posix, flock, dotfile, afp, none)
    pub lock_style: Option<String>,

    /// Offset of the PENDING lock byte
    pub pending_byte: Option<u64>,

    /// Number of bytes in the SHARED range
    pub shared_size: Option<u64>,

    /// Default verbosity level (0-3)
    pub verbosity: Option<u8>,

    /// Sync the directory after creating journals
    pub dir_sync: Option<bool>,

    /// Use the full-barrier flush where available
    pub full_fsync: Option<bool>,
}

impl Config {
    /// Load configuration from the default path, or return empty config if not found.
    pub fn load() -> Result<Self> {
        let path = config_path()?;

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// VFS configuration from file defaults, with `style` taking precedence.
    pub fn vfs_config(&self, style: Option<LockStyleChoice>) -> Result<VfsConfig> {
        let d = &self.defaults;
        let mut config = VfsConfig::default();

        let file_style = d
            .lock_style
            .as_deref()
            .map(str::parse::<LockStyleChoice>)
            .transpose()
            .context("Invalid lock_style in config")?;
        if let Some(style) = style.or(file_style) {
            config = config.with_lock_style(style);
        }

        if d.pending_byte.is_some() || d.shared_size.is_some() {
            let default = LockLayout::default();
            let layout = LockLayout::new(
                d.pending_byte.unwrap_or(default.pending_byte()),
                d.shared_size.unwrap_or(default.shared_size()),
            )
            .context("Invalid lock layout in config")?;
            config = config.with_layout(layout);
        }
        if let Some(dir_sync) = d.dir_sync {
            config = config.with_dir_sync(dir_sync);
        }
        if let Some(full_fsync) = d.full_fsync {
            config = config.with_full_fsync(full_fsync);
        }
        Ok(config)
    }
}

/// Get the path to the configuration file.
pub fn config_path() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir).join("config.toml"));
    }

    let base_dirs = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(base_dirs.config_dir().join("oxvfs").join("config.toml"))
}
