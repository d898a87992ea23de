//! Plugin registry: resolves the ordered list of plugins to test.
//!
//! A [`PluginSource`] knows where the canonical plugin list is declared and
//! turns it into [`PluginSpec`]s. [`Registry::resolve`] then makes the list
//! deterministic (sorted by identifier, duplicates rejected), applies test
//! path overrides and removes everything in the [`SkipSet`].
//!
//! # Built-in Sources
//!
//! | Source | Module | Declared in |
//! |--------|--------|-------------|
//! | Pyproject | [`pyproject`] | `[project.optional-dependencies]` group + lock file |
//! | Index | [`index`] | Standalone `[[plugins]]` TOML file |

pub mod index;
pub mod pyproject;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::{RegistryConfig, expand_path};
use crate::plugin::{PluginSpec, SkipSet, normalize_id};

pub use index::IndexSource;
pub use pyproject::PyprojectSource;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// The plugin list could not be resolved. Always fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The source of truth could not be read.
    #[error("plugin source {source_name} is unreachable: {reason}")]
    Unreachable { source_name: String, reason: String },

    /// The source of truth was read but does not describe a plugin list.
    #[error("plugin source {source_name} is malformed: {reason}")]
    Malformed { source_name: String, reason: String },
}

impl RegistryError {
    pub fn unreachable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unreachable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Where the canonical plugin list is declared.
pub trait PluginSource: Send + Sync {
    /// Human-readable description used in logs and errors.
    fn describe(&self) -> String;

    /// Reads every declared plugin, in source order.
    fn load(&self) -> RegistryResult<Vec<PluginSpec>>;
}

/// Builds the source selected by the configuration.
pub fn source_from_config(config: &RegistryConfig) -> Box<dyn PluginSource> {
    match config {
        RegistryConfig::Pyproject(cfg) => {
            let mut source = PyprojectSource::new(
                expand_path(&cfg.manifest),
                cfg.lock.as_deref().map(expand_path),
                cfg.group.clone(),
            );
            if let Some(metadata) = &cfg.metadata {
                source = source.with_metadata(expand_path(metadata));
            }
            Box::new(source)
        }
        RegistryConfig::Index(cfg) => Box::new(IndexSource::new(expand_path(&cfg.path))),
    }
}

/// Resolves plugins from a source with no test path overrides.
///
/// # Example
///
/// ```no_run
/// use plugin_tests::plugin::SkipSet;
/// use plugin_tests::registry::{IndexSource, resolve};
///
/// let source = IndexSource::new("plugins.toml".into());
/// let skip = SkipSet::parse_list("nomad-plugin-slow")?;
/// let plugins = resolve(&source, &skip)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn resolve(source: &dyn PluginSource, skip: &SkipSet) -> RegistryResult<Vec<PluginSpec>> {
    Registry::new(source).resolve(skip)
}

/// Resolves a [`PluginSource`] into the run's ordered plugin list.
pub struct Registry<'a> {
    source: &'a dyn PluginSource,
    test_paths: BTreeMap<String, PathBuf>,
}

impl<'a> Registry<'a> {
    pub fn new(source: &'a dyn PluginSource) -> Self {
        Self {
            source,
            test_paths: BTreeMap::new(),
        }
    }

    /// Overrides test targets by plugin identifier.
    pub fn with_test_paths(mut self, paths: &BTreeMap<String, PathBuf>) -> Self {
        self.test_paths = paths
            .iter()
            .map(|(id, path)| (normalize_id(id), path.clone()))
            .collect();
        self
    }

    /// Returns every declared plugin not in `skip`, sorted by identifier.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::Unreachable`] if the source cannot be read
    /// - [`RegistryError::Malformed`] if it cannot be parsed or declares the
    ///   same plugin twice
    pub fn resolve(&self, skip: &SkipSet) -> RegistryResult<Vec<PluginSpec>> {
        let source_name = self.source.describe();
        let mut plugins = self.source.load()?;

        let mut seen = HashSet::new();
        for plugin in &plugins {
            if !seen.insert(plugin.normalized_id()) {
                return Err(RegistryError::malformed(
                    &source_name,
                    format!("plugin '{}' is declared more than once", plugin.id),
                ));
            }
        }

        plugins.sort_by(|a, b| a.id.cmp(&b.id));

        for plugin in &mut plugins {
            if let Some(path) = self.test_paths.get(&plugin.normalized_id()) {
                debug!("Test target for {}: {}", plugin.id, path.display());
                plugin.test_target = Some(path.clone());
            }
        }

        for entry in skip.iter() {
            if !seen.contains(entry) {
                warn!("Skip list entry '{}' matches no plugin in {}", entry, source_name);
            }
        }

        let declared = plugins.len();
        plugins.retain(|p| !skip.contains(&p.id));

        info!(
            "Resolved {} plugins from {} ({} skipped)",
            plugins.len(),
            source_name,
            declared - plugins.len()
        );

        Ok(plugins)
    }
}

/// A fixed in-memory plugin list.
///
/// Useful for embedding and tests.
pub struct StaticSource {
    plugins: Vec<PluginSpec>,
}

impl StaticSource {
    pub fn new(plugins: Vec<PluginSpec>) -> Self {
        Self { plugins }
    }
}

impl PluginSource for StaticSource {
    fn describe(&self) -> String {
        "static plugin list".to_string()
    }

    fn load(&self) -> RegistryResult<Vec<PluginSpec>> {
        Ok(self.plugins.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(plugins: &[PluginSpec]) -> Vec<&str> {
        plugins.iter().map(|p| p.id.as_str()).collect()
    }

    fn source(names: &[&str]) -> StaticSource {
        StaticSource::new(names.iter().map(|n| PluginSpec::new(*n)).collect())
    }

    #[test]
    fn test_resolve_sorts_by_identifier() {
        let src = source(&["E", "B", "D", "A", "C"]);
        let plugins = resolve(&src, &SkipSet::new()).unwrap();
        assert_eq!(ids(&plugins), vec!["A", "B", "C", "D", "E"]);
    }

    #[test]
    fn test_resolve_applies_skip_set() {
        let src = source(&["A", "B", "C", "D", "E"]);
        let skip = SkipSet::parse_list("C").unwrap();
        let plugins = resolve(&src, &skip).unwrap();
        assert_eq!(ids(&plugins), vec!["A", "B", "D", "E"]);
    }

    #[test]
    fn test_resolve_skip_matches_normalized_names() {
        let src = source(&["nomad_plugin_a", "nomad-plugin-b"]);
        let skip = SkipSet::parse_list("Nomad-Plugin-A, unknown-plugin").unwrap();
        let plugins = resolve(&src, &skip).unwrap();
        assert_eq!(ids(&plugins), vec!["nomad-plugin-b"]);
    }

    #[test]
    fn test_resolve_rejects_duplicates() {
        let src = source(&["plugin-a", "plugin_a"]);
        let err = resolve(&src, &SkipSet::new()).unwrap_err();
        assert!(matches!(err, RegistryError::Malformed { .. }));
    }

    #[test]
    fn test_resolve_applies_test_paths() {
        let src = source(&["nomad-plugin-a", "nomad-plugin-b"]);
        let mut paths = BTreeMap::new();
        paths.insert("nomad_plugin_a".to_string(), PathBuf::from("tests/unit"));

        let plugins = Registry::new(&src)
            .with_test_paths(&paths)
            .resolve(&SkipSet::new())
            .unwrap();

        assert_eq!(plugins[0].test_target, Some(PathBuf::from("tests/unit")));
        assert_eq!(plugins[1].test_target, None);
    }

    #[test]
    fn test_resolve_propagates_source_errors() {
        let src = IndexSource::new(PathBuf::from("/nonexistent/plugins.toml"));
        let err = resolve(&src, &SkipSet::new()).unwrap_err();
        assert!(matches!(err, RegistryError::Unreachable { .. }));
    }

    #[test]
    fn test_pyproject_config_uses_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("pyproject.toml");
        let metadata = dir.path().join("plugins.toml");
        std::fs::write(
            &manifest,
            "[project.optional-dependencies]\nplugins = [\"nomad-plugin-x==2.0\"]\n",
        )
        .unwrap();
        std::fs::write(
            &metadata,
            "[[plugins]]\nname = \"nomad-plugin-x\"\nurl = \"https://github.com/org/x\"\n",
        )
        .unwrap();

        let config = RegistryConfig::Pyproject(crate::config::PyprojectRegistryConfig {
            manifest,
            lock: None,
            group: "plugins".to_string(),
            metadata: Some(metadata),
        });
        let plugins = resolve(source_from_config(&config).as_ref(), &SkipSet::new()).unwrap();

        let source = plugins[0].source.as_ref().unwrap();
        assert_eq!(source.url, "https://github.com/org/x.git");
        assert_eq!(source.version.as_deref(), Some("2.0"));
    }
}
