//! Isolation pipeline: tests one plugin in its own throwaway workspace.
//!
//! ```text
//!  PluginSpec
//!      │
//!      ▼
//!  ┌─────────┐   ┌───────────┐   ┌──────┐
//!  │  fetch  │──►│ provision │──►│ test │──► classify ──► ExecutionOutcome
//!  └─────────┘   └───────────┘   └──────┘
//!      │              │              │
//!      └──────────────┴──────────────┴──► cleanup (always)
//! ```
//!
//! Every plugin gets a fresh temporary root named after its identifier
//! inside the work directory, its own environment and its own log file.
//! Whatever happens inside a stage (an error, a timeout, a cancellation) is
//! caught at the plugin boundary and turned into an [`ExecutionOutcome`];
//! [`IsolationPipeline::execute`] never fails. The environment and the
//! temporary root are removed on every path.

use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::config::{Config, StageTimeouts, expand_path};
use crate::logs::PluginLog;
use crate::plugin::{
    ExecutionOutcome, PluginSpec, PluginStatus, SourceLocation, Stage, path_component,
};
use crate::provider::{EnvHandle, EnvRequest, Fetcher, Provisioner, RunnerReport, TestRunner};

/// Reason recorded for plugins without a repository URL.
pub const NO_SOURCE_REASON: &str = "no source repository";

/// Reason recorded for plugins never started because the run was cancelled.
pub const CANCELLED_BEFORE_START: &str = "run cancelled before start";

/// Where the pipeline puts per-plugin resources, and how long stages may run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Parent of the per-plugin temporary roots.
    pub work_dir: PathBuf,
    /// Parent of the per-plugin log directories.
    pub log_dir: PathBuf,
    pub timeouts: StageTimeouts,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let work_dir = config
            .run
            .work_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(std::env::temp_dir);

        Self {
            work_dir,
            log_dir: expand_path(&config.run.log_dir),
            timeouts: config.timeouts.clone(),
        }
    }
}

/// Why a stage did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StageFailure {
    stage: Stage,
    reason: String,
}

impl StageFailure {
    fn error(stage: Stage, err: impl Display) -> Self {
        Self {
            stage,
            reason: err.to_string(),
        }
    }

    fn timed_out(stage: Stage, limit: Duration) -> Self {
        Self {
            stage,
            reason: format!("{} timed out after {:?}", stage, limit),
        }
    }

    fn cancelled(stage: Stage) -> Self {
        Self {
            stage,
            reason: format!("{} cancelled", stage),
        }
    }
}

/// Runs plugins through fetch, provision and test.
pub struct IsolationPipeline<F, P, T> {
    fetcher: F,
    provisioner: P,
    runner: T,
    settings: PipelineSettings,
    cancel: CancellationToken,
}

impl<F, P, T> IsolationPipeline<F, P, T>
where
    F: Fetcher,
    P: Provisioner,
    T: TestRunner,
{
    pub fn new(fetcher: F, provisioner: P, runner: T, settings: PipelineSettings) -> Self {
        Self {
            fetcher,
            provisioner,
            runner,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to cancel in-flight stages.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Tests one plugin in isolation.
    pub async fn execute(&self, plugin: &PluginSpec) -> ExecutionOutcome {
        self.execute_attempt(plugin, 1).await
    }

    /// Tests one plugin; attempts after the first append to its log.
    pub async fn execute_attempt(&self, plugin: &PluginSpec, attempt: u32) -> ExecutionOutcome {
        let span = info_span!("plugin", id = %plugin.id, attempt);
        self.run_isolated(plugin, attempt)
            .instrument(span)
            .await
            .with_attempts(attempt)
    }

    async fn run_isolated(&self, plugin: &PluginSpec, attempt: u32) -> ExecutionOutcome {
        let start = Instant::now();

        let Some(source) = &plugin.source else {
            tracing::warn!("Skipping {}: {}", plugin.id, NO_SOURCE_REASON);
            return ExecutionOutcome::new(&plugin.id, PluginStatus::Skipped)
                .with_reason(NO_SOURCE_REASON);
        };

        if self.cancel.is_cancelled() {
            return ExecutionOutcome::new(&plugin.id, PluginStatus::Errored)
                .with_reason(CANCELLED_BEFORE_START);
        }

        let log = match PluginLog::create(&self.settings.log_dir, &plugin.id, attempt > 1) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!("Cannot open log for {}: {}", plugin.id, e);
                return ExecutionOutcome::new(&plugin.id, PluginStatus::Errored)
                    .with_stage(Stage::Setup)
                    .with_reason(format!("cannot open plugin log: {}", e))
                    .with_duration(start.elapsed());
            }
        };
        log.info(format!("Testing {} (attempt {})", plugin.id, attempt));

        let workspace = match self.create_workspace(plugin) {
            Ok(dir) => dir,
            Err(e) => {
                log.error(format!("Cannot create temporary root: {}", e));
                return self.finish(
                    plugin,
                    &log,
                    start,
                    Err(StageFailure::error(
                        Stage::Setup,
                        format!("cannot create temporary root: {}", e),
                    )),
                );
            }
        };
        log.debug(format!("Temporary root {}", workspace.path().display()));

        let mut env = None;
        let verdict = self
            .run_stages(plugin, source, workspace.path(), &log, &mut env)
            .await;

        if let Some(env) = env
            && let Err(e) = self.provisioner.destroy_env(&env).await
        {
            log.warn(format!("Environment cleanup failed: {}", e));
        }
        remove_workspace(workspace, &log).await;

        self.finish(plugin, &log, start, verdict)
    }

    fn create_workspace(&self, plugin: &PluginSpec) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.settings.work_dir)?;
        tempfile::Builder::new()
            .prefix(&format!("{}-", path_component(&plugin.id)))
            .tempdir_in(&self.settings.work_dir)
    }

    async fn run_stages(
        &self,
        plugin: &PluginSpec,
        source: &SourceLocation,
        workspace: &Path,
        log: &PluginLog,
        env_slot: &mut Option<EnvHandle>,
    ) -> Result<RunnerReport, StageFailure> {
        let timeouts = &self.settings.timeouts;

        log.info(format!("Fetching {} with {}", source.url, self.fetcher.name()));
        let dest = workspace.join("src");
        let checkout = self
            .bounded(Stage::Fetch, timeouts.fetch(), self.fetcher.fetch(source, &dest, log))
            .await?;

        log.info(format!("Provisioning with {}", self.provisioner.name()));
        let request = EnvRequest {
            plugin: &plugin.id,
            checkout: &checkout,
            manifest: &plugin.manifest,
            workspace,
        };
        let env = self
            .bounded(
                Stage::Provision,
                timeouts.provision(),
                self.provisioner.create_env(&request, log),
            )
            .await?;
        let env = env_slot.insert(env);

        let target = match &plugin.test_target {
            Some(path) => checkout.join(path),
            None => checkout.clone(),
        };
        log.info(format!("Running {} on {}", self.runner.name(), target.display()));
        self.bounded(Stage::Test, timeouts.test(), self.runner.run(env, &target, log))
            .await
    }

    /// Runs one stage under its timeout and the run's cancellation token.
    ///
    /// Dropping `work` on timeout or cancellation kills any child process
    /// it started.
    async fn bounded<V, E, Fut>(
        &self,
        stage: Stage,
        limit: Option<Duration>,
        work: Fut,
    ) -> Result<V, StageFailure>
    where
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        let limited = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result.map_err(|e| StageFailure::error(stage, e)),
                    Err(_) => Err(StageFailure::timed_out(stage, limit)),
                },
                None => work.await.map_err(|e| StageFailure::error(stage, e)),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StageFailure::cancelled(stage)),
            result = limited => result,
        }
    }

    fn finish(
        &self,
        plugin: &PluginSpec,
        log: &PluginLog,
        start: Instant,
        verdict: Result<RunnerReport, StageFailure>,
    ) -> ExecutionOutcome {
        let mut outcome = match verdict {
            Ok(report) => {
                let (status, reason) = classify(&report);
                let outcome = ExecutionOutcome::new(&plugin.id, status)
                    .with_stage(Stage::Test)
                    .with_counts(report.counts);
                match reason {
                    Some(reason) => outcome.with_reason(reason),
                    None => outcome,
                }
            }
            Err(failure) => {
                log.error(format!("{} stage failed: {}", failure.stage, failure.reason));
                ExecutionOutcome::new(&plugin.id, PluginStatus::Errored)
                    .with_stage(failure.stage)
                    .with_reason(failure.reason)
            }
        }
        .with_duration(start.elapsed());

        if let Some(path) = log.path() {
            outcome = outcome.with_log_path(path);
        }

        log.info(format!(
            "Finished {}: {} in {:.1}s",
            plugin.id,
            outcome.status,
            outcome.duration.as_secs_f64()
        ));
        outcome
    }
}

/// Deletes a temporary root off the async workers; a checkout plus its
/// environment can take a while to remove.
async fn remove_workspace(workspace: tempfile::TempDir, log: &PluginLog) {
    let root = workspace.path().to_path_buf();
    match tokio::task::spawn_blocking(move || workspace.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log.warn(format!("Could not remove {}: {}", root.display(), e)),
        Err(e) => log.warn(format!("Removal of {} did not finish: {}", root.display(), e)),
    }
}

/// Maps a completed test run onto a plugin status.
///
/// Any failing or erroring test fails the plugin. A run that collected no
/// tests at all is a skip.
pub fn classify(report: &RunnerReport) -> (PluginStatus, Option<String>) {
    let counts = report.counts;
    if counts.failed > 0 || counts.errored > 0 {
        (
            PluginStatus::Failed,
            Some(format!(
                "{} failed, {} errored, {} passed",
                counts.failed, counts.errored, counts.passed
            )),
        )
    } else if counts.total() == 0 {
        (PluginStatus::Skipped, Some("no tests collected".to_string()))
    } else {
        (PluginStatus::Passed, None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::TestCounts;
    use crate::provider::mock::{Behavior, MockToolchain, spec};

    type MockPipeline =
        IsolationPipeline<Arc<MockToolchain>, Arc<MockToolchain>, Arc<MockToolchain>>;

    struct Fixture {
        _dir: tempfile::TempDir,
        work_dir: PathBuf,
        log_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                work_dir: dir.path().join("work"),
                log_dir: dir.path().join("logs"),
                _dir: dir,
            }
        }

        fn pipeline(&self, mock: &Arc<MockToolchain>, timeouts: StageTimeouts) -> MockPipeline {
            let settings = PipelineSettings {
                work_dir: self.work_dir.clone(),
                log_dir: self.log_dir.clone(),
                timeouts,
            };
            IsolationPipeline::new(mock.clone(), mock.clone(), mock.clone(), settings)
        }

        fn leftover_roots(&self) -> usize {
            std::fs::read_dir(&self.work_dir)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn test_execute_passing_plugin() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new());
        let pipeline = fx.pipeline(&mock, StageTimeouts::default());

        let outcome = pipeline.execute(&spec("plugin-a")).await;

        assert_eq!(outcome.status, PluginStatus::Passed);
        assert_eq!(outcome.stage, Some(Stage::Test));
        assert_eq!(outcome.counts.unwrap().passed, 3);
        assert_eq!(outcome.attempts, 1);

        let log = outcome.log_path.unwrap();
        assert_eq!(log, fx.log_dir.join("plugin-a").join("test_output.log"));
        assert!(std::fs::read_to_string(log).unwrap().contains("mock fetch mock://plugin-a"));

        assert_eq!(mock.envs_created(), 1);
        assert_eq!(mock.envs_destroyed(), 1);
        assert_eq!(fx.leftover_roots(), 0);
    }

    #[tokio::test]
    async fn test_failing_tests_are_failed() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new().with("plugin-a", Behavior::FailTests));
        let outcome = fx.pipeline(&mock, StageTimeouts::default()).execute(&spec("plugin-a")).await;

        assert_eq!(outcome.status, PluginStatus::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("1 failed, 0 errored, 2 passed"));
    }

    #[tokio::test]
    async fn test_fetch_error_is_isolated() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new().with("plugin-b", Behavior::Break(Stage::Fetch)));
        let pipeline = fx.pipeline(&mock, StageTimeouts::default());

        let b = pipeline.execute(&spec("plugin-b")).await;
        assert_eq!(b.status, PluginStatus::Errored);
        assert_eq!(b.stage, Some(Stage::Fetch));
        assert!(b.reason.unwrap().contains("mock fetch failure"));
        assert_eq!(mock.envs_created(), 0);

        let a = pipeline.execute(&spec("plugin-a")).await;
        assert_eq!(a.status, PluginStatus::Passed);
        assert_eq!(fx.leftover_roots(), 0);
    }

    #[tokio::test]
    async fn test_provision_error_still_cleans_up() {
        let fx = Fixture::new();
        let mock =
            Arc::new(MockToolchain::new().with("plugin-b", Behavior::Break(Stage::Provision)));
        let outcome = fx
            .pipeline(&mock, StageTimeouts::default())
            .execute(&spec("plugin-b"))
            .await;

        assert_eq!(outcome.status, PluginStatus::Errored);
        assert_eq!(outcome.stage, Some(Stage::Provision));
        assert_eq!(fx.leftover_roots(), 0);
    }

    #[tokio::test]
    async fn test_runner_crash_is_errored() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new().with("plugin-c", Behavior::Break(Stage::Test)));
        let outcome = fx.pipeline(&mock, StageTimeouts::default()).execute(&spec("plugin-c")).await;

        assert_eq!(outcome.status, PluginStatus::Errored);
        assert_eq!(outcome.stage, Some(Stage::Test));
        assert_eq!(mock.envs_destroyed(), 1);
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new().with("plugin-slow", Behavior::Hang(Stage::Test)));
        let timeouts = StageTimeouts {
            test_secs: Some(1),
            ..StageTimeouts::default()
        };

        let outcome = fx.pipeline(&mock, timeouts).execute(&spec("plugin-slow")).await;

        assert_eq!(outcome.status, PluginStatus::Errored);
        assert_eq!(outcome.stage, Some(Stage::Test));
        assert_eq!(outcome.reason.as_deref(), Some("test timed out after 1s"));
        assert_eq!(mock.envs_destroyed(), 1);
        assert_eq!(fx.leftover_roots(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_stage() {
        let fx = Fixture::new();
        let mock =
            Arc::new(MockToolchain::new().with("plugin-a", Behavior::Hang(Stage::Provision)));
        let token = CancellationToken::new();
        let pipeline = fx
            .pipeline(&mock, StageTimeouts::default())
            .with_cancellation(token.clone());

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        };
        let plugin = spec("plugin-a");
        let (outcome, ()) = tokio::join!(pipeline.execute(&plugin), canceller);

        assert_eq!(outcome.status, PluginStatus::Errored);
        assert_eq!(outcome.reason.as_deref(), Some("provision cancelled"));
        assert_eq!(fx.leftover_roots(), 0);

        let later = pipeline.execute(&spec("plugin-b")).await;
        assert_eq!(later.reason.as_deref(), Some(CANCELLED_BEFORE_START));
    }

    #[tokio::test]
    async fn test_plugin_without_source_is_skipped() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new());
        let outcome = fx
            .pipeline(&mock, StageTimeouts::default())
            .execute(&PluginSpec::new("docs-only"))
            .await;

        assert_eq!(outcome.status, PluginStatus::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some(NO_SOURCE_REASON));
        assert!(mock.started().is_empty());
    }

    #[tokio::test]
    async fn test_retry_attempt_appends_to_log() {
        let fx = Fixture::new();
        let mock = Arc::new(MockToolchain::new());
        let pipeline = fx.pipeline(&mock, StageTimeouts::default());

        pipeline.execute(&spec("plugin-a")).await;
        let second = pipeline.execute_attempt(&spec("plugin-a"), 2).await;
        assert_eq!(second.attempts, 2);

        let log = std::fs::read_to_string(second.log_path.unwrap()).unwrap();
        assert!(log.contains("(attempt 1)"));
        assert!(log.contains("(attempt 2)"));
    }

    #[tokio::test]
    async fn test_remove_workspace_deletes_nested_tree() {
        let workspace = tempfile::tempdir().unwrap();
        let root = workspace.path().to_path_buf();
        let bin = root.join("env/lib/python3.12/site-packages/pkg");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("module.py"), "x = 1\n").unwrap();
        std::fs::write(root.join("checkout.txt"), "src").unwrap();

        // A sibling task keeps running while the tree is removed.
        let sibling = tokio::spawn(async { 7 });
        remove_workspace(workspace, &PluginLog::detached("plugin-a")).await;

        assert!(!root.exists());
        assert_eq!(sibling.await.unwrap(), 7);
    }

    #[test]
    fn test_classify() {
        let report = |passed, failed, errored| RunnerReport {
            counts: TestCounts {
                passed,
                failed,
                errored,
                skipped: 0,
            },
            ..RunnerReport::default()
        };

        assert_eq!(classify(&report(3, 0, 0)).0, PluginStatus::Passed);
        assert_eq!(classify(&report(3, 1, 0)).0, PluginStatus::Failed);
        assert_eq!(classify(&report(3, 0, 1)).0, PluginStatus::Failed);
        assert_eq!(
            classify(&report(0, 0, 0)),
            (PluginStatus::Skipped, Some("no tests collected".to_string()))
        );
    }
}
