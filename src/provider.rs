//! Collaborators that do the actual work of testing one plugin.
//!
//! The isolation pipeline drives three collaborators in order, each behind
//! a trait so the pipeline can be exercised without git, uv or pytest:
//!
//! ```text
//! ┌──────────┐  checkout   ┌─────────────┐  EnvHandle   ┌────────────┐
//! │ Fetcher  │ ──────────► │ Provisioner │ ───────────► │ TestRunner │
//! │ (git)    │             │ (uv venv)   │              │ (pytest)   │
//! └──────────┘             └─────────────┘              └────────────┘
//!                                 ▲                            │
//!                                 └────── destroy_env() ◄──────┘
//! ```
//!
//! # Built-in Collaborators
//!
//! | Collaborator | Module | Description |
//! |--------------|--------|-------------|
//! | [`GitFetcher`] | [`git`] | Shallow clone, then commit or release tag checkout |
//! | [`UvProvisioner`] | [`uv`] | Fresh virtual environment per plugin |
//! | [`PytestRunner`] | [`pytest`] | Runs pytest, reads the JUnit report |
//!
//! Every collaborator writes what it does to the plugin's [`PluginLog`].
//! Errors are per-plugin: a collaborator error never ends the run, it
//! becomes an `Errored` outcome for that plugin only.

pub mod git;
#[cfg(test)]
pub mod mock;
pub mod process;
pub mod pytest;
pub mod uv;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::logs::PluginLog;
use crate::plugin::{SourceLocation, TestCounts};

pub use git::GitFetcher;
pub use process::{ExecResult, ProcessError, exec};
pub use pytest::PytestRunner;
pub use uv::UvProvisioner;

/// The plugin source could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("clone of {url} failed: {reason}")]
    Clone { url: String, reason: String },

    #[error("could not check out {wanted}")]
    Checkout { wanted: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// The plugin's environment could not be created or removed.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to create environment: {0}")]
    CreateEnv(String),

    #[error("dependency manifest {} not found", .0.display())]
    MissingManifest(PathBuf),

    #[error("failed to install {what}: {reason}")]
    Install { what: String, reason: String },

    #[error("failed to remove environment {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// The test runner itself broke; distinct from tests failing.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("test runner crashed: {0}")]
    Crashed(String),

    #[error("unreadable test report: {0}")]
    UnreadableReport(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// What the provisioner needs to build a plugin environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvRequest<'a> {
    /// Plugin identifier.
    pub plugin: &'a str,
    /// Fetched source tree.
    pub checkout: &'a Path,
    /// Dependency manifest, relative to `checkout`.
    pub manifest: &'a Path,
    /// The plugin's private temporary root; the environment must live
    /// under it.
    pub workspace: &'a Path,
}

/// A provisioned, plugin-private environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvHandle {
    /// Plugin this environment belongs to.
    pub plugin: String,
    /// Environment directory, removed by [`Provisioner::destroy_env`].
    pub root: PathBuf,
    /// Interpreter inside the environment.
    pub python: PathBuf,
    /// Source tree the environment was built for.
    pub checkout: PathBuf,
    /// The plugin's temporary root.
    pub workspace: PathBuf,
}

/// Counts and timing from one test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerReport {
    pub counts: TestCounts,
    pub duration: Duration,
    /// One-line summary printed by the runner, if any.
    pub summary: Option<String>,
}

/// Obtains a plugin's source tree.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Fetches `source` into `dest` and returns the checkout root.
    async fn fetch(
        &self,
        source: &SourceLocation,
        dest: &Path,
        log: &PluginLog,
    ) -> Result<PathBuf, FetchError>;
}

/// Creates and destroys plugin environments.
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Creates a fresh environment with the plugin's dependencies installed.
    async fn create_env(
        &self,
        request: &EnvRequest<'_>,
        log: &PluginLog,
    ) -> Result<EnvHandle, ProvisionError>;

    /// Removes an environment. Idempotent.
    async fn destroy_env(&self, env: &EnvHandle) -> Result<(), ProvisionError>;
}

/// Runs a plugin's tests inside its environment.
#[async_trait]
pub trait TestRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the tests under `target`.
    ///
    /// Failing tests are reported through the returned counts. An `Err`
    /// means no trustworthy counts exist.
    async fn run(
        &self,
        env: &EnvHandle,
        target: &Path,
        log: &PluginLog,
    ) -> Result<RunnerReport, RunnerError>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch(
        &self,
        source: &SourceLocation,
        dest: &Path,
        log: &PluginLog,
    ) -> Result<PathBuf, FetchError> {
        (**self).fetch(source, dest, log).await
    }
}

#[async_trait]
impl<P: Provisioner + ?Sized> Provisioner for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn create_env(
        &self,
        request: &EnvRequest<'_>,
        log: &PluginLog,
    ) -> Result<EnvHandle, ProvisionError> {
        (**self).create_env(request, log).await
    }

    async fn destroy_env(&self, env: &EnvHandle) -> Result<(), ProvisionError> {
        (**self).destroy_env(env).await
    }
}

#[async_trait]
impl<T: TestRunner + ?Sized> TestRunner for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn run(
        &self,
        env: &EnvHandle,
        target: &Path,
        log: &PluginLog,
    ) -> Result<RunnerReport, RunnerError> {
        (**self).run(env, target, log).await
    }
}

/// A command to run as a child process.
///
/// # Example
///
/// ```
/// use plugin_tests::provider::Command;
///
/// let cmd = Command::new("git")
///     .args(["clone", "--depth", "1"])
///     .arg("https://github.com/org/plugin.git")
///     .arg("checkout dir")
///     .env("GIT_TERMINAL_PROMPT", "0");
///
/// assert_eq!(
///     cmd.to_shell_string(),
///     "git clone --depth 1 https://github.com/org/plugin.git 'checkout dir'"
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Merged over the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds a path argument.
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Renders the command for logs.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| shell_escape(part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@'))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Last non-empty line of some output, for error messages.
pub(crate) fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
}
