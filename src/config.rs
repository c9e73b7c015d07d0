//! Configuration loading and schema definitions for modshard.
//!
//! This module provides types and functions for loading modshard
//! configuration from TOML files or strings. The schema covers scheduling,
//! devices, the per-shard driver and reporting.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads modshard configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use modshard::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("modshard.toml"))?;
/// println!("Devices: {}", config.devices.len());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads modshard configuration from a TOML string.
///
/// # Example
///
/// ```
/// use modshard::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [harness]
///     shard_count = 4
///
///     [coordinator]
///     disable_reboot = true
/// "#)?;
///
/// assert_eq!(config.harness.shard_count, Some(4));
/// assert!(config.coordinator.disable_reboot);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
