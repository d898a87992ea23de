//! Configuration loading and schema definitions for plugin-tests.
//!
//! Configuration comes from a TOML file (default `plugin-tests.toml`). Every
//! section is optional; a missing section falls back to the defaults
//! documented in [`schema`]. Command-line flags are applied on top by the
//! binary.
//!
//! # The configuration file format is described in the README.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the configuration file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "plugin-tests.toml";

/// Invalid run parameters. Always fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The node count must be at least one.
    #[error("node count must be at least 1, got {0}")]
    InvalidNodeCount(usize),

    /// The node index is outside `0..node_count`.
    #[error("node index {index} is out of range for {count} node(s)")]
    NodeIndexOutOfRange { index: usize, count: usize },

    /// The 1-based CI node number is outside `1..=node_count`.
    #[error("CI node {number} is out of range 1..={count}")]
    NodeNumberOutOfRange { number: usize, count: usize },

    /// The skip list contains an entry that is not a plugin name.
    #[error("malformed skip list: {0}")]
    MalformedSkipList(String),
}

/// Loads plugin-tests configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not match the schema.
///
/// # Example
///
/// ```no_run
/// use plugin_tests::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("plugin-tests.toml"))?;
/// println!("Max parallel: {}", config.run.max_parallel);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads plugin-tests configuration from a TOML string.
///
/// # Example
///
/// ```
/// use plugin_tests::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     max_parallel = 4
///
///     [registry]
///     type = "index"
///     path = "plugins.toml"
/// "#)?;
///
/// assert_eq!(config.run.max_parallel, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the configuration the CLI asked for.
///
/// An explicitly named file must exist. When no file was named and the
/// default file is absent, built-in defaults are used.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config> {
    match explicit {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                load_config(default)
            } else {
                tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                Ok(Config::default())
            }
        }
    }
}

/// Expands `~` and `$VARS` in a configured path.
///
/// Unknown variables leave the path untouched rather than failing.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::warn!("Could not expand path {}: {}", raw, e);
            path.to_path_buf()
        }
    }
}
