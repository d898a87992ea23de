//! Run orchestration: resolve, plan, execute, aggregate.
//!
//! # Architecture
//!
//! ```text
//!   PluginSource
//!        │ Registry::resolve(skip)
//!        ▼
//!   Vec<PluginSpec> (sorted, skips removed)
//!        │ shard::plan(index, count)
//!        ▼
//!   ShardPlan ──────────────► Reporter::on_plan_ready
//!        │
//!        │ bounded fan-out (max_parallel)
//!        ▼
//!   IsolationPipeline::execute ──► retries ──► Reporter::on_plugin_complete
//!        │
//!        ▼
//!   aggregate() ──► RunSummary ──► Reporter::on_run_complete
//! ```
//!
//! Registry and planning errors abort the run before any plugin is tested
//! and surface as [`RunError`]. Anything that goes wrong inside a plugin's
//! pipeline is part of that plugin's outcome and never stops the others.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Every plugin passed or was skipped |
//! | 1 | At least one plugin failed or errored |
//! | 2 | Fatal error, no plugins tested |
//!
//! # Example
//!
//! ```no_run
//! use plugin_tests::config::load_config;
//! use plugin_tests::orchestrator::Orchestrator;
//! use plugin_tests::pipeline::{IsolationPipeline, PipelineSettings};
//! use plugin_tests::plugin::SkipSet;
//! use plugin_tests::provider::{GitFetcher, PytestRunner, UvProvisioner};
//! use plugin_tests::registry::{Registry, source_from_config};
//! use plugin_tests::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("plugin-tests.toml"))?;
//!
//!     let pipeline = IsolationPipeline::new(
//!         GitFetcher::new(config.git.clone()),
//!         UvProvisioner::new(config.provision.clone()),
//!         PytestRunner::new(config.tests.extra_args()?),
//!         PipelineSettings::from_config(&config),
//!     );
//!     let orchestrator = Orchestrator::new(pipeline, ConsoleReporter::new(false))
//!         .with_max_parallel(config.run.max_parallel);
//!
//!     let source = source_from_config(&config.registry);
//!     let registry = Registry::new(source.as_ref());
//!     let summary = orchestrator.run(&registry, &SkipSet::new(), 0, 1).await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::pipeline::{CANCELLED_BEFORE_START, IsolationPipeline};
use crate::plugin::{ExecutionOutcome, PluginSpec, PluginStatus, SkipSet};
use crate::provider::{Fetcher, Provisioner, TestRunner};
use crate::registry::{Registry, RegistryError};
use crate::report::Reporter;
use crate::shard::{self, ShardPlan};
use crate::summary::{RunSummary, aggregate};

/// Every plugin passed or was skipped.
pub const EXIT_SUCCESS: i32 = 0;
/// At least one plugin failed or errored.
pub const EXIT_PLUGIN_FAILURES: i32 = 1;
/// The run was aborted before testing.
pub const EXIT_FATAL: i32 = 2;

/// A fatal error that aborted the run before any plugin was tested.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("registry resolution failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("shard planning failed: {0}")]
    Config(#[from] ConfigError),
}

impl RunError {
    /// Name of the stage that aborted the run.
    pub fn stage(&self) -> &'static str {
        match self {
            RunError::Registry(_) => "registry resolution",
            RunError::Config(_) => "shard planning",
        }
    }

    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }
}

/// Drives one node's share of a plugin test run.
pub struct Orchestrator<F, P, T, R> {
    pipeline: IsolationPipeline<F, P, T>,
    reporter: R,
    max_parallel: usize,
    retries: u32,
}

impl<F, P, T, R> Orchestrator<F, P, T, R>
where
    F: Fetcher,
    P: Provisioner,
    T: TestRunner,
    R: Reporter,
{
    /// Creates a sequential orchestrator without retries.
    pub fn new(pipeline: IsolationPipeline<F, P, T>, reporter: R) -> Self {
        Self {
            pipeline,
            reporter,
            max_parallel: 1,
            retries: 0,
        }
    }

    /// Number of plugins tested at once; values below 1 mean 1.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Extra attempts for plugins that fail or error.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn pipeline(&self) -> &IsolationPipeline<F, P, T> {
        &self.pipeline
    }

    /// Resolves, plans and tests this node's plugins.
    ///
    /// # Errors
    ///
    /// [`RunError`] if the registry cannot be resolved or the node slot is
    /// invalid. Plugin failures are reported in the returned summary.
    pub async fn run(
        &self,
        registry: &Registry<'_>,
        skip: &SkipSet,
        node_index: usize,
        node_count: usize,
    ) -> Result<RunSummary, RunError> {
        let plugins = registry.resolve(skip)?;
        let plan = shard::plan(&plugins, node_index, node_count)?;

        info!(
            "Node {}/{}: {} of {} plugins assigned",
            plan.slot().number(),
            node_count,
            plan.len(),
            plugins.len()
        );

        Ok(self.run_plan(&plan).await)
    }

    /// Tests an already computed shard.
    pub async fn run_plan(&self, plan: &ShardPlan) -> RunSummary {
        self.reporter.on_plan_ready(plan).await;

        let outcomes: Vec<ExecutionOutcome> = stream::iter(plan.plugins())
            .map(|plugin| self.run_plugin(plugin))
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        let summary = aggregate(outcomes);
        info!(
            "Run complete: {} passed, {} failed, {} errored, {} skipped",
            summary.passed, summary.failed, summary.errored, summary.skipped
        );

        self.reporter.on_run_complete(&summary).await;
        summary
    }

    /// Runs one plugin, retrying failures while attempts remain.
    async fn run_plugin(&self, plugin: &PluginSpec) -> ExecutionOutcome {
        let cancel = self.pipeline.cancellation_token();
        if cancel.is_cancelled() {
            let outcome = ExecutionOutcome::new(&plugin.id, PluginStatus::Errored)
                .with_reason(CANCELLED_BEFORE_START);
            self.reporter.on_plugin_complete(&outcome).await;
            return outcome;
        }

        self.reporter.on_plugin_start(plugin).await;

        let mut attempt = 1;
        let mut outcome = self.pipeline.execute_attempt(plugin, attempt).await;
        while !outcome.status.is_success() && attempt <= self.retries && !cancel.is_cancelled() {
            attempt += 1;
            warn!(
                "{} {} ({}), retrying (attempt {} of {})",
                plugin.id,
                outcome.status,
                outcome.reason.as_deref().unwrap_or("no reason"),
                attempt,
                self.retries + 1
            );
            outcome = self.pipeline.execute_attempt(plugin, attempt).await;
        }

        if attempt > 1 && outcome.status == PluginStatus::Passed {
            warn!("{} is flaky: passed on attempt {}", plugin.id, attempt);
        }

        self.reporter.on_plugin_complete(&outcome).await;
        outcome
    }
}
