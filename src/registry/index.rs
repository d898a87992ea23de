//! Plugins declared in a standalone TOML index.
//!
//! ```toml
//! [[plugins]]
//! name = "nomad-plugin-a"
//! url = "https://github.com/org/nomad-plugin-a"
//! commit = "3f2c9e1"
//!
//! [[plugins]]
//! name = "nomad-plugin-b"
//! repository = "https://github.com/org/nomad-plugin-b.git"
//! version = "1.0.2"
//! test_path = "tests/unit"
//!
//! [[plugins]]
//! name = "nomad-plugin-docs-only"
//! homepage = "https://example.org/docs"
//! ```
//!
//! The clone URL is selected by [`select_git_url`]. Entries without a
//! usable URL are kept with no source and end up skipped at execution time.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use super::{PluginSource, RegistryError, RegistryResult};
use crate::plugin::{DEFAULT_MANIFEST, PluginSpec, SourceLocation};

/// Host required for URLs inferred from project metadata.
const GIT_HOST: &str = "github.com";

/// Reads plugins from a `[[plugins]]` TOML file.
pub struct IndexSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default)]
    plugins: Vec<IndexEntry>,
}

/// One `[[plugins]]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexEntry {
    pub name: String,
    pub url: Option<String>,
    pub repository: Option<String>,
    pub homepage: Option<String>,
    pub commit: Option<String>,
    pub version: Option<String>,
    pub manifest: Option<PathBuf>,
    pub test_path: Option<PathBuf>,
}

impl IndexSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PluginSource for IndexSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> RegistryResult<Vec<PluginSpec>> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| RegistryError::unreachable(self.describe(), e))?;

        let index: IndexFile =
            toml::from_str(&content).map_err(|e| RegistryError::malformed(self.describe(), e))?;

        index
            .plugins
            .into_iter()
            .map(|entry| {
                if entry.name.trim().is_empty() {
                    return Err(RegistryError::malformed(
                        self.describe(),
                        "plugin entry with empty name",
                    ));
                }
                Ok(entry_to_spec(entry))
            })
            .collect()
    }
}

fn entry_to_spec(entry: IndexEntry) -> PluginSpec {
    let mut spec = PluginSpec::new(entry.name.trim())
        .with_manifest(entry.manifest.unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST)));

    if let Some(path) = entry.test_path {
        spec = spec.with_test_target(path);
    }

    match select_git_url(
        entry.url.as_deref(),
        entry.repository.as_deref(),
        entry.homepage.as_deref(),
    ) {
        Some(url) => {
            let mut source = SourceLocation::new(url);
            source.commit = entry.commit;
            source.version = entry.version;
            spec.with_source(source)
        }
        None => {
            warn!("No repository URL for plugin '{}'", spec.id);
            spec
        }
    }
}

/// Picks a clone URL from plugin metadata.
///
/// An explicit `url` always wins and gets a `.git` suffix if it lacks one.
/// Otherwise `repository`, then `homepage`, are used when they point at the
/// git host.
///
/// ```
/// use plugin_tests::registry::index::select_git_url;
///
/// assert_eq!(
///     select_git_url(Some("https://github.com/org/p"), None, None).as_deref(),
///     Some("https://github.com/org/p.git"),
/// );
/// assert_eq!(
///     select_git_url(
///         None,
///         Some("https://gitlab.com/org/p"),
///         Some("https://github.com/org/p"),
///     )
///     .as_deref(),
///     Some("https://github.com/org/p"),
/// );
/// assert_eq!(select_git_url(None, None, Some("https://example.org")), None);
/// ```
pub fn select_git_url(
    url: Option<&str>,
    repository: Option<&str>,
    homepage: Option<&str>,
) -> Option<String> {
    if let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) {
        return Some(if url.ends_with(".git") {
            url.to_string()
        } else {
            format!("{}.git", url.trim_end_matches('/'))
        });
    }

    [repository, homepage]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| candidate.contains(GIT_HOST))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(content: &str) -> RegistryResult<Vec<PluginSpec>> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.toml");
        std::fs::write(&path, content).unwrap();
        IndexSource::new(path).load()
    }

    #[test]
    fn test_load_index() {
        let plugins = load(
            r#"
            [[plugins]]
            name = "nomad-plugin-a"
            url = "https://github.com/org/nomad-plugin-a"
            commit = "3f2c9e1"

            [[plugins]]
            name = "nomad-plugin-b"
            repository = "https://github.com/org/nomad-plugin-b.git"
            version = "1.0.2"
            manifest = "python/pyproject.toml"
            test_path = "tests/unit"

            [[plugins]]
            name = "nomad-plugin-c"
            homepage = "https://example.org/docs"
            "#,
        )
        .unwrap();

        assert_eq!(plugins.len(), 3);

        let a = plugins[0].source.as_ref().unwrap();
        assert_eq!(a.url, "https://github.com/org/nomad-plugin-a.git");
        assert_eq!(a.commit.as_deref(), Some("3f2c9e1"));

        let b = &plugins[1];
        assert_eq!(b.source.as_ref().unwrap().version.as_deref(), Some("1.0.2"));
        assert_eq!(b.manifest, PathBuf::from("python/pyproject.toml"));
        assert_eq!(b.test_target, Some(PathBuf::from("tests/unit")));

        assert!(plugins[2].source.is_none());
        assert_eq!(plugins[2].manifest, PathBuf::from(DEFAULT_MANIFEST));
    }

    #[test]
    fn test_empty_index() {
        assert!(load("").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_field_is_malformed() {
        let result = load(
            r#"
            [[plugins]]
            name = "a"
            branch = "main"
            "#,
        );
        assert!(matches!(result, Err(RegistryError::Malformed { .. })));
    }

    #[test]
    fn test_empty_name_is_malformed() {
        let result = load("[[plugins]]\nname = \"  \"\n");
        assert!(matches!(result, Err(RegistryError::Malformed { .. })));
    }

    #[test]
    fn test_select_git_url_priority() {
        assert_eq!(
            select_git_url(Some("https://github.com/org/p/"), Some("https://github.com/x/y"), None),
            Some("https://github.com/org/p.git".to_string())
        );
        assert_eq!(
            select_git_url(Some(""), Some("https://github.com/x/y"), None),
            Some("https://github.com/x/y".to_string())
        );
        assert_eq!(select_git_url(None, None, None), None);
    }
}
