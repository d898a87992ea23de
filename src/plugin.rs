//! Plugin data model.
//!
//! These are the values that flow through a run, in order:
//!
//! ```text
//!  PluginSpec ──► ShardPlan ──► ExecutionOutcome ──► RunSummary
//!  (registry)     (planner)     (pipeline)           (aggregator)
//! ```
//!
//! Every value is created once by the component that owns it and is handed
//! downstream without being mutated again.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Default dependency manifest inside a plugin checkout.
pub const DEFAULT_MANIFEST: &str = "pyproject.toml";

/// A plugin package resolved from the registry.
///
/// Immutable once resolved. The identifier is unique within a run and is
/// used to namespace every per-plugin resource (temporary root, environment,
/// log file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Unique plugin identifier (distribution name).
    pub id: String,

    /// Where to fetch the plugin source from.
    ///
    /// `None` when the plugin metadata carries no usable repository URL.
    /// Such plugins are reported as skipped and never fetched.
    pub source: Option<SourceLocation>,

    /// Dependency manifest, relative to the checkout root.
    pub manifest: PathBuf,

    /// Test target relative to the checkout root. `None` means the whole
    /// checkout.
    pub test_target: Option<PathBuf>,
}

impl PluginSpec {
    /// Creates a plugin with the default manifest and no source.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            test_target: None,
        }
    }

    /// Sets the source location.
    pub fn with_source(mut self, source: SourceLocation) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the dependency manifest path.
    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.manifest = manifest.into();
        self
    }

    /// Sets the test target path.
    pub fn with_test_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.test_target = Some(target.into());
        self
    }

    /// Identifier folded for comparisons (see [`normalize_id`]).
    pub fn normalized_id(&self) -> String {
        normalize_id(&self.id)
    }
}

/// Git location of a plugin's source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Clone URL.
    pub url: String,

    /// Pinned ref, if any. Usually a commit hash, but requirement URLs may
    /// also pin a tag or branch name.
    pub commit: Option<String>,

    /// Released version, used to derive tag names when no commit is pinned
    /// or the commit cannot be checked out.
    pub version: Option<String>,
}

impl SourceLocation {
    /// Creates a location tracking the default branch.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            commit: None,
            version: None,
        }
    }

    /// Pins a commit (or any other ref).
    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    /// Records the released version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Returns `true` for development versions, which have no release tag.
    pub fn is_dev_version(&self) -> bool {
        self.version.as_deref().is_some_and(|v| v.contains(".dev"))
    }

    /// Refs to try, in order, after cloning.
    ///
    /// The pinned ref comes first. Release tags (`v<version>`, then
    /// `<version>`) follow as a fallback; placeholder `0.0.0` versions and
    /// development versions never produce tags. An empty list means the
    /// default branch is used as cloned.
    ///
    /// ```
    /// use plugin_tests::plugin::{GitRef, SourceLocation};
    ///
    /// let source = SourceLocation::new("https://github.com/org/plugin.git")
    ///     .with_commit("abc123")
    ///     .with_version("1.2.0");
    ///
    /// assert_eq!(
    ///     source.candidate_refs(),
    ///     vec![
    ///         GitRef::Pinned("abc123".into()),
    ///         GitRef::Tag("v1.2.0".into()),
    ///         GitRef::Tag("1.2.0".into()),
    ///     ]
    /// );
    /// ```
    pub fn candidate_refs(&self) -> Vec<GitRef> {
        let mut refs = Vec::new();

        if let Some(commit) = &self.commit {
            refs.push(GitRef::Pinned(commit.clone()));
        }

        if let Some(version) = &self.version
            && !self.is_dev_version()
        {
            let prefixed = format!("v{}", version);
            if prefixed != "v0.0.0" {
                refs.push(GitRef::Tag(prefixed));
            }
            if version != "0.0.0" {
                refs.push(GitRef::Tag(version.clone()));
            }
        }

        refs
    }
}

/// A git ref the fetcher can check out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRef {
    /// Whatever the source pins: a commit hash, tag or branch.
    Pinned(String),
    /// A release tag derived from the version.
    Tag(String),
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Pinned(reference) => write!(f, "pinned ref {}", reference),
            GitRef::Tag(tag) => write!(f, "tag {}", tag),
        }
    }
}

/// Folds a plugin identifier for comparison.
///
/// Package indexes treat `-`, `_` and `.` as equivalent and ignore case, so
/// `Nomad_Plugin.Foo` and `nomad-plugin-foo` name the same plugin.
pub fn normalize_id(id: &str) -> String {
    id.trim()
        .chars()
        .map(|c| match c {
            '_' | '.' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Turns an identifier into a single safe path component.
pub fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        s => s.to_string(),
    }
}

/// Set of plugin identifiers excluded from a run.
///
/// Entries are stored normalized, so lookups are insensitive to case and to
/// `-`/`_`/`.` spelling differences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipSet {
    entries: BTreeSet<String>,
}

impl SkipSet {
    /// Creates an empty skip set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list such as `"plugin-a, plugin_b"`.
    ///
    /// Blank entries (e.g. a trailing comma) are ignored. An entry that is
    /// not a plausible package name is a [`ConfigError::MalformedSkipList`].
    pub fn parse_list(list: &str) -> Result<Self, ConfigError> {
        let mut set = Self::new();
        set.extend_from(list.split(','))?;
        Ok(set)
    }

    /// Loads a skip file: one identifier per line, `#` starts a comment.
    /// Commas are also accepted as separators.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::MalformedSkipList(format!("cannot read {}: {}", path.display(), e))
        })?;

        let mut set = Self::new();
        let entries = content
            .lines()
            .map(|line| line.split('#').next().unwrap_or(""))
            .flat_map(|line| line.split(','));
        set.extend_from(entries)?;
        Ok(set)
    }

    /// Adds every entry of `other`.
    pub fn merge(&mut self, other: SkipSet) {
        self.entries.extend(other.entries);
    }

    /// Adds a single identifier.
    pub fn insert(&mut self, id: &str) -> Result<(), ConfigError> {
        self.extend_from(std::iter::once(id))
    }

    fn extend_from<'a>(&mut self, raw: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
        for entry in raw {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if !is_valid_identifier(entry) {
                return Err(ConfigError::MalformedSkipList(format!(
                    "invalid plugin name '{}'",
                    entry
                )));
            }
            self.entries.insert(normalize_id(entry));
        }
        Ok(())
    }

    /// Returns `true` if the plugin is excluded.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains(&normalize_id(id))
    }

    /// Normalized entries, sorted.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Package names: ASCII letters, digits, `-`, `_`, `.`, starting with a
/// letter or digit.
fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Terminal classification of one plugin's test attempt.
///
/// | Status | Meaning | Fails the run? |
/// |--------|---------|----------------|
/// | Passed | Every collected test passed | No |
/// | Failed | At least one test failed or errored | Yes |
/// | Errored | Fetch, provisioning or the runner itself broke, or timed out | Yes |
/// | Skipped | Nothing to test (no source, no tests collected) | No |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl PluginStatus {
    /// Returns `true` if this status does not fail the run.
    pub fn is_success(&self) -> bool {
        matches!(self, PluginStatus::Passed | PluginStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Passed => "passed",
            PluginStatus::Failed => "failed",
            PluginStatus::Errored => "errored",
            PluginStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that decided an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Workspace and log preparation before any collaborator runs.
    Setup,
    Fetch,
    Provision,
    Test,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::Fetch => "fetch",
            Stage::Provision => "provision",
            Stage::Test => "test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-test counts reported by the test runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    pub skipped: u32,
}

impl TestCounts {
    pub fn total(&self) -> u32 {
        self.passed
            .saturating_add(self.failed)
            .saturating_add(self.errored)
            .saturating_add(self.skipped)
    }
}

/// Result of running one plugin through the isolation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Plugin identifier.
    pub plugin: String,

    pub status: PluginStatus,

    /// Wall-clock time spent on this plugin, cleanup included.
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Why the plugin did not pass, if it didn't.
    pub reason: Option<String>,

    /// Stage that decided the outcome. `None` for skips decided before any
    /// stage ran.
    pub stage: Option<Stage>,

    /// Test counts, when the runner produced them.
    pub counts: Option<TestCounts>,

    /// Captured log for this plugin.
    pub log_path: Option<PathBuf>,

    /// How many times the pipeline ran for this plugin.
    pub attempts: u32,
}

impl ExecutionOutcome {
    /// Creates an outcome with no details attached.
    pub fn new(plugin: impl Into<String>, status: PluginStatus) -> Self {
        Self {
            plugin: plugin.into(),
            status,
            duration: Duration::ZERO,
            reason: None,
            stage: None,
            counts: None,
            log_path: None,
            attempts: 1,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_counts(mut self, counts: TestCounts) -> Self {
        self.counts = Some(counts);
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Serializes durations as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
