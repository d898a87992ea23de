//! Configuration schema definitions for plugin-tests.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunSettings        - Parallelism, retries, scratch and log directories
//! ├── StageTimeouts      - Optional per-stage time bounds
//! ├── RegistryConfig     - Tagged enum selecting where the plugin list lives
//! │   ├── Pyproject      - Optional-dependency group of a pyproject.toml
//! │   └── Index          - Standalone TOML plugin index
//! ├── GitConfig          - Source fetching
//! ├── ProvisionConfig    - uv environment provisioning
//! ├── TestsConfig        - pytest invocation and per-plugin test paths
//! └── ReportConfig       - JSON / JUnit report output
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for plugin-tests.
///
/// # Example
///
/// ```
/// use plugin_tests::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [run]
///     max_parallel = 2
///
///     [registry]
///     type = "index"
///     path = "plugins.toml"
/// "#).unwrap();
/// assert_eq!(config.run.max_parallel, 2);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunSettings,

    #[serde(default)]
    pub timeouts: StageTimeouts,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub provision: ProvisionConfig,

    #[serde(default)]
    pub tests: TestsConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core run settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | 1 (sequential) |
/// | `retries` | 0 |
/// | `work_dir` | system temp directory |
/// | `log_dir` | `logs` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunSettings {
    /// Maximum number of plugin pipelines running at once on this node.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Re-runs of a failed or errored plugin.
    #[serde(default)]
    pub retries: u32,

    /// Parent directory for the per-plugin temporary roots.
    pub work_dir: Option<PathBuf>,

    /// Directory receiving `<plugin>/test_output.log` files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            retries: 0,
            work_dir: None,
            log_dir: default_log_dir(),
        }
    }
}

fn default_max_parallel() -> usize {
    1
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// Optional time bound for each pipeline stage, in seconds.
///
/// ```toml
/// [timeouts]
/// fetch_secs = 300
/// provision_secs = 1200
/// test_secs = 1800
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StageTimeouts {
    pub fetch_secs: Option<u64>,
    pub provision_secs: Option<u64>,
    pub test_secs: Option<u64>,
}

impl StageTimeouts {
    /// Applies the same bound to every stage.
    pub fn uniform(secs: u64) -> Self {
        Self {
            fetch_secs: Some(secs),
            provision_secs: Some(secs),
            test_secs: Some(secs),
        }
    }

    pub fn fetch(&self) -> Option<Duration> {
        self.fetch_secs.map(Duration::from_secs)
    }

    pub fn provision(&self) -> Option<Duration> {
        self.provision_secs.map(Duration::from_secs)
    }

    pub fn test(&self) -> Option<Duration> {
        self.test_secs.map(Duration::from_secs)
    }
}

/// Where the canonical plugin list is declared.
///
/// ```toml
/// # The plugin extras group of a distribution's pyproject.toml
/// [registry]
/// type = "pyproject"
/// manifest = "pyproject.toml"
/// lock = "requirements.txt"
/// group = "plugins"
///
/// # A standalone index file
/// [registry]
/// type = "index"
/// path = "plugins.toml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    Pyproject(PyprojectRegistryConfig),
    Index(IndexRegistryConfig),
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig::Pyproject(PyprojectRegistryConfig::default())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PyprojectRegistryConfig {
    /// Distribution manifest declaring the plugins.
    #[serde(default = "default_pyproject")]
    pub manifest: PathBuf,

    /// Lock file whose pinned git requirements override the manifest.
    /// A missing lock file is tolerated.
    #[serde(default = "default_lock")]
    pub lock: Option<PathBuf>,

    /// Optional-dependency group listing the plugins.
    #[serde(default = "default_group")]
    pub group: String,

    /// `[[plugins]]` index giving repository, version and test path for
    /// plugins that are not git requirements. Must exist when set.
    #[serde(default)]
    pub metadata: Option<PathBuf>,
}

impl Default for PyprojectRegistryConfig {
    fn default() -> Self {
        Self {
            manifest: default_pyproject(),
            lock: default_lock(),
            group: default_group(),
            metadata: None,
        }
    }
}

fn default_pyproject() -> PathBuf {
    PathBuf::from("pyproject.toml")
}

fn default_lock() -> Option<PathBuf> {
    Some(PathBuf::from("requirements.txt"))
}

fn default_group() -> String {
    "plugins".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexRegistryConfig {
    /// TOML file with `[[plugins]]` tables.
    pub path: PathBuf,
}

/// Source fetching settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitConfig {
    /// Git executable.
    #[serde(default = "default_git")]
    pub program: String,

    /// Clone with `--depth 1`.
    #[serde(default = "default_true")]
    pub shallow: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_git(),
            shallow: true,
        }
    }
}

fn default_git() -> String {
    "git".to_string()
}

/// Environment provisioning settings.
///
/// ```toml
/// [provision]
/// uv = "uv"
/// python = "3.12"
/// requirements = "requirements.txt"
/// constrain = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisionConfig {
    /// uv executable.
    #[serde(default = "default_uv")]
    pub uv: String,

    /// Interpreter request passed to `uv venv -p`.
    #[serde(default = "default_python")]
    pub python: String,

    /// Distribution requirements installed into every environment before
    /// the plugin itself.
    #[serde(default = "default_requirements")]
    pub requirements: Option<PathBuf>,

    /// Use the distribution requirements as constraints for the plugin
    /// install.
    #[serde(default = "default_true")]
    pub constrain: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            uv: default_uv(),
            python: default_python(),
            requirements: default_requirements(),
            constrain: true,
        }
    }
}

fn default_uv() -> String {
    "uv".to_string()
}

fn default_python() -> String {
    "3.12".to_string()
}

fn default_requirements() -> Option<PathBuf> {
    Some(PathBuf::from("requirements.txt"))
}

/// Test runner settings.
///
/// ```toml
/// [tests]
/// extra_args = "-x"
///
/// [tests.paths]
/// "nomad-plugin-simulation" = "tests/unit"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TestsConfig {
    /// Extra arguments appended to the pytest invocation (shell syntax).
    #[serde(default)]
    pub extra_args: String,

    /// Test target per plugin, relative to its checkout.
    #[serde(default)]
    pub paths: BTreeMap<String, PathBuf>,
}

impl TestsConfig {
    /// Splits [`extra_args`](Self::extra_args) into words.
    pub fn extra_args(&self) -> Result<Vec<String>, shell_words::ParseError> {
        shell_words::split(&self.extra_args)
    }
}

/// Report output settings.
///
/// ```toml
/// [report]
/// output_dir = "plugin-test-results"
/// json_file = "report.json"
/// junit = true
/// junit_file = "junit.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Filename of the JSON run report.
    #[serde(default = "default_json_file")]
    pub json_file: String,

    /// Whether to also write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename of the JUnit XML report.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            json_file: default_json_file(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("plugin-test-results")
}

fn default_json_file() -> String {
    "report.json".to_string()
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_true() -> bool {
    true
}
