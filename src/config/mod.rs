//! Configuration module for Mirage
//!
//! This module provides configuration types and parsing for the server.

mod server;
mod users;

pub use server::{PortRedirectionMode, ServerConfig, VirtualFsConfig};
pub use users::{UserEntry, WILDCARD_PASSWORD};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener, authentication and session settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Virtual filesystem settings
    #[serde(default)]
    pub virtualfs: VirtualFsConfig,

    /// Fabricated accounts
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        for user in &self.users {
            if user.name.is_empty() {
                return Err("user entry with empty name".to_string());
            }
        }
        Ok(())
    }

    /// Resolve relative file paths against `base` (the config file's directory)
    pub fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let Some(p) = self.server.banner.as_mut() {
            join(p);
        }
        if let Some(p) = self.server.host_key.as_mut() {
            join(p);
        }
        if let Some(p) = self.virtualfs.saved_file_dir.as_mut() {
            join(p);
        }
        join(&mut self.server.session_log_dir);
    }
}

/// Load configuration from a TOML file
///
/// Relative paths inside the file are resolved against its directory.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    let mut config = parse_config(&content)?;
    if let Some(dir) = path.as_ref().parent() {
        config.resolve_paths(dir);
    }
    Ok(config)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}
