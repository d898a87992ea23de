//! Scriptable in-memory collaborators for pipeline and orchestrator tests.
//!
//! A plugin's behaviour is chosen by its identifier; plugins built with
//! [`spec`] carry a `mock://<id>` URL that the mock maps back to the id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    EnvHandle, EnvRequest, FetchError, Fetcher, ProvisionError, Provisioner, RunnerError,
    RunnerReport, TestRunner,
};
use crate::logs::PluginLog;
use crate::plugin::{PluginSpec, SourceLocation, Stage, TestCounts};

const SCHEME: &str = "mock://";

/// A plugin whose behaviour is looked up by identifier.
pub fn spec(id: &str) -> PluginSpec {
    PluginSpec::new(id).with_source(SourceLocation::new(format!("{}{}", SCHEME, id)))
}

/// What the mock does for one plugin.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Three passing tests.
    Pass,
    /// One failing test out of three.
    FailTests,
    /// The runner collects nothing.
    NoTests,
    /// The given stage returns an error.
    Break(Stage),
    /// The given stage never finishes.
    Hang(Stage),
    /// Fails the first `n` runs, then passes.
    FlakyTimes(usize),
}

#[derive(Default)]
pub struct MockToolchain {
    behaviors: Mutex<HashMap<String, Behavior>>,
    delay: Option<Duration>,
    runs: Mutex<HashMap<String, usize>>,
    started: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl MockToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: &str, behavior: Behavior) -> Self {
        if let Ok(mut behaviors) = self.behaviors.lock() {
            behaviors.insert(id.to_string(), behavior);
        }
        self
    }

    /// Makes every fetch take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn behavior(&self, id: &str) -> Behavior {
        self.behaviors
            .lock()
            .ok()
            .and_then(|b| b.get(id).cloned())
            .unwrap_or(Behavior::Pass)
    }

    /// Plugins whose fetch started, in order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn envs_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn envs_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn stage(&self, id: &str, stage: Stage) -> Result<(), String> {
        match self.behavior(id) {
            Behavior::Break(s) if s == stage => Err(format!("mock {} failure", stage)),
            Behavior::Hang(s) if s == stage => {
                std::future::pending::<()>().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn plugin_id(source: &SourceLocation) -> &str {
    source.url.strip_prefix(SCHEME).unwrap_or(&source.url)
}

struct InFlight<'a>(&'a MockToolchain);

impl<'a> InFlight<'a> {
    fn enter(mock: &'a MockToolchain) -> Self {
        let now = mock.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        mock.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(mock)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for MockToolchain {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(
        &self,
        source: &SourceLocation,
        dest: &Path,
        log: &PluginLog,
    ) -> Result<PathBuf, FetchError> {
        let id = plugin_id(source).to_string();
        if let Ok(mut started) = self.started.lock() {
            started.push(id.clone());
        }
        let _guard = InFlight::enter(self);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        log.info(format!("mock fetch {}", source.url));

        self.stage(&id, Stage::Fetch)
            .await
            .map_err(|reason| FetchError::Clone {
                url: source.url.clone(),
                reason,
            })?;

        std::fs::create_dir_all(dest).map_err(|e| FetchError::Clone {
            url: source.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl Provisioner for MockToolchain {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_env(
        &self,
        request: &EnvRequest<'_>,
        _log: &PluginLog,
    ) -> Result<EnvHandle, ProvisionError> {
        self.stage(request.plugin, Stage::Provision)
            .await
            .map_err(ProvisionError::CreateEnv)?;

        let root = request.workspace.join("venv");
        std::fs::create_dir_all(&root).map_err(|e| ProvisionError::CreateEnv(e.to_string()))?;
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(EnvHandle {
            plugin: request.plugin.to_string(),
            python: root.join("bin").join("python"),
            root,
            checkout: request.checkout.to_path_buf(),
            workspace: request.workspace.to_path_buf(),
        })
    }

    async fn destroy_env(&self, env: &EnvHandle) -> Result<(), ProvisionError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        match std::fs::remove_dir_all(&env.root) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(ProvisionError::Remove {
                path: env.root.clone(),
                source: e,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TestRunner for MockToolchain {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(
        &self,
        env: &EnvHandle,
        _target: &Path,
        _log: &PluginLog,
    ) -> Result<RunnerReport, RunnerError> {
        self.stage(&env.plugin, Stage::Test)
            .await
            .map_err(RunnerError::Crashed)?;

        let run = self
            .runs
            .lock()
            .map(|mut runs| {
                let n = runs.entry(env.plugin.clone()).or_insert(0);
                *n += 1;
                *n
            })
            .unwrap_or(1);

        let failing = TestCounts {
            passed: 2,
            failed: 1,
            ..TestCounts::default()
        };
        let passing = TestCounts {
            passed: 3,
            ..TestCounts::default()
        };

        let counts = match self.behavior(&env.plugin) {
            Behavior::FailTests => failing,
            Behavior::FlakyTimes(n) if run <= n => failing,
            Behavior::NoTests => TestCounts::default(),
            _ => passing,
        };

        Ok(RunnerReport {
            counts,
            duration: Duration::from_millis(1),
            summary: None,
        })
    }
}
