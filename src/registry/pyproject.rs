//! Plugins declared in an optional-dependency group of a `pyproject.toml`.
//!
//! A distribution lists its plugins in one group:
//!
//! ```toml
//! [project.optional-dependencies]
//! plugins = [
//!   "nomad-plugin-a @ git+https://github.com/org/nomad-plugin-a.git@3f2c9e1",
//!   "nomad-plugin-b @ git+https://github.com/org/nomad-plugin-b.git@v1.0.2",
//!   "nomad-plugin-c==1.4.0",
//! ]
//! ```
//!
//! Every entry is a plugin. Git requirements carry their own clone URL and
//! pinned ref. Plugins released to a package index carry at most a version;
//! their repository comes from an optional metadata file in the
//! [`IndexSource`] format, matched by normalized name. Without one they stay
//! in the plan with no source and are reported as skipped.
//!
//! A lock file (`requirements.txt` as produced by `uv pip compile`) takes
//! precedence over the manifest: `name @ git+<url>@<hash>` lines re-pin git
//! plugins and `name==<version>` lines fix the released version.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::index::IndexSource;
use super::{PluginSource, RegistryError, RegistryResult};
use crate::plugin::{PluginSpec, SourceLocation, normalize_id};

/// `name[extras]`, then a direct reference or version specifiers, then
/// optional environment markers.
static REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[[^\]]*\])?\s*([^;]*?)\s*(?:;.*)?$")
        .expect("requirement pattern")
});

/// `@ git+<url>@<ref>` direct reference.
static GIT_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@\s*git\+(\S+)@([^@\s]+)$").expect("git reference pattern"));

/// `==<version>` among comma-separated specifiers.
static VERSION_PIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|,)\s*===?\s*([A-Za-z0-9][A-Za-z0-9.+!_-]*)\s*(?:,|$)")
        .expect("version pin pattern")
});

/// `name @ git+<url>@<hexhash>` anywhere on a lock file line.
static LOCK_GIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9][A-Za-z0-9._-]*)\s*@\s*git\+(\S+)@([0-9a-f]{7,40})\b")
        .expect("lock git pattern")
});

/// `name==<version>` at the start of a lock file line.
static LOCK_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)(?:\[[^\]]*\])?\s*==\s*([^\s;\\]+)")
        .expect("lock version pattern")
});

/// Reads plugins from a pyproject optional-dependency group.
pub struct PyprojectSource {
    manifest: PathBuf,
    lock: Option<PathBuf>,
    group: String,
    metadata: Option<PathBuf>,
}

/// What one group entry says about a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Git { url: String, reference: String },
    Released { version: Option<String> },
}

/// A pin read from the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Locked {
    Git { url: String, commit: String },
    Version(String),
}

impl PyprojectSource {
    pub fn new(manifest: PathBuf, lock: Option<PathBuf>, group: impl Into<String>) -> Self {
        Self {
            manifest,
            lock,
            group: group.into(),
            metadata: None,
        }
    }

    /// Repository metadata for plugins that are not git requirements.
    pub fn with_metadata(mut self, metadata: PathBuf) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reads the lock file. Absence or unreadability only costs the
    /// override, so it is a warning rather than an error.
    fn load_lock(&self) -> HashMap<String, Locked> {
        let Some(path) = &self.lock else {
            return HashMap::new();
        };

        match std::fs::read_to_string(path) {
            Ok(content) => parse_lock(&content),
            Err(e) => {
                warn!("Lock file {} not used: {}", path.display(), e);
                HashMap::new()
            }
        }
    }

    /// Metadata entries by normalized name. A configured file must exist.
    fn load_metadata(&self) -> RegistryResult<HashMap<String, PluginSpec>> {
        let Some(path) = &self.metadata else {
            return Ok(HashMap::new());
        };

        let specs = IndexSource::new(path.clone()).load()?;
        Ok(specs
            .into_iter()
            .map(|spec| (spec.normalized_id(), spec))
            .collect())
    }

    fn group_entries(&self, doc: &toml::Table) -> RegistryResult<Vec<String>> {
        let entries = doc
            .get("project")
            .and_then(|p| p.get("optional-dependencies"))
            .and_then(|d| d.get(&self.group))
            .ok_or_else(|| {
                RegistryError::malformed(
                    self.describe(),
                    format!("missing [project.optional-dependencies].{}", self.group),
                )
            })?
            .as_array()
            .ok_or_else(|| {
                RegistryError::malformed(self.describe(), format!("'{}' is not a list", self.group))
            })?;

        entries
            .iter()
            .map(|entry| {
                entry.as_str().map(str::to_string).ok_or_else(|| {
                    RegistryError::malformed(
                        self.describe(),
                        format!("non-string requirement {}", entry),
                    )
                })
            })
            .collect()
    }
}

impl PluginSource for PyprojectSource {
    fn describe(&self) -> String {
        format!("{} [{}]", self.manifest.display(), self.group)
    }

    fn load(&self) -> RegistryResult<Vec<PluginSpec>> {
        let content = std::fs::read_to_string(&self.manifest)
            .map_err(|e| RegistryError::unreachable(self.describe(), e))?;

        let doc: toml::Table =
            toml::from_str(&content).map_err(|e| RegistryError::malformed(self.describe(), e))?;

        let entries = self.group_entries(&doc)?;
        let lock = self.load_lock();
        let mut metadata = self.load_metadata()?;

        // Later declarations of the same package replace earlier ones.
        let mut order: Vec<String> = Vec::new();
        let mut plugins: HashMap<String, PluginSpec> = HashMap::new();

        for line in &entries {
            let Some((name, requirement)) = parse_requirement(line) else {
                return Err(RegistryError::malformed(
                    self.describe(),
                    format!("unparseable requirement '{}'", line),
                ));
            };

            let key = normalize_id(&name);
            let known = metadata.remove(&key).or_else(|| plugins.get(&key).cloned());
            let spec = merge(name, requirement, lock.get(&key), known);

            if !plugins.contains_key(&key) {
                order.push(key.clone());
            }
            plugins.insert(key, spec);
        }

        for name in metadata.keys() {
            debug!("Metadata for '{}' unused, not in group {}", name, self.group);
        }

        Ok(order
            .into_iter()
            .filter_map(|key| plugins.remove(&key))
            .collect())
    }
}

/// Builds the spec for one group entry.
///
/// `known` carries the test path, manifest and repository from metadata.
/// Git requirements bring their own location; released plugins take the
/// known repository and the most specific version (lock, then manifest
/// pin, then metadata).
fn merge(
    name: String,
    requirement: Requirement,
    locked: Option<&Locked>,
    known: Option<PluginSpec>,
) -> PluginSpec {
    let mut spec = match known {
        Some(known) => PluginSpec {
            id: name,
            ..known
        },
        None => PluginSpec::new(name),
    };

    match requirement {
        Requirement::Git { url, reference } => {
            let source = match locked {
                Some(Locked::Git { url, commit }) => {
                    debug!("Using locked commit {} for {}", commit, spec.id);
                    SourceLocation::new(url).with_commit(commit)
                }
                _ => SourceLocation::new(url).with_commit(reference),
            };
            spec.source = Some(source);
        }
        Requirement::Released { version } => {
            let version = match locked {
                Some(Locked::Version(locked)) => Some(locked.clone()),
                _ => version,
            };
            match spec.source.as_mut() {
                Some(source) => {
                    if version.is_some() {
                        source.version = version;
                    }
                }
                None => warn!(
                    "No repository known for plugin '{}', it will be skipped",
                    spec.id
                ),
            }
        }
    }

    spec
}

fn parse_requirement(line: &str) -> Option<(String, Requirement)> {
    let caps = REQUIREMENT.captures(line)?;
    let name = caps[1].to_string();
    let rest = caps[2].trim();

    if let Some(git) = GIT_REFERENCE.captures(rest) {
        let requirement = Requirement::Git {
            url: git[1].to_string(),
            reference: git[2].to_string(),
        };
        return Some((name, requirement));
    }

    // Non-git direct references (wheels, archives) carry no usable version.
    let version = if rest.starts_with('@') {
        None
    } else {
        VERSION_PIN.captures(rest).map(|pin| pin[1].to_string())
    };
    Some((name, Requirement::Released { version }))
}

fn parse_lock(content: &str) -> HashMap<String, Locked> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| {
            if let Some(caps) = LOCK_GIT.captures(line) {
                let locked = Locked::Git {
                    url: caps[2].to_string(),
                    commit: caps[3].to_string(),
                };
                return Some((normalize_id(&caps[1]), locked));
            }
            LOCK_VERSION
                .captures(line)
                .map(|caps| (normalize_id(&caps[1]), Locked::Version(caps[2].to_string())))
        })
        .collect()
}
