//! Result aggregation.

use std::time::Duration;

use serde::Serialize;

use crate::orchestrator::{EXIT_PLUGIN_FAILURES, EXIT_SUCCESS};
use crate::plugin::{ExecutionOutcome, PluginStatus};

/// Combined result of every plugin tested on this node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    /// Plugins that passed only after a retry.
    pub flaky: usize,
    /// One outcome per plugin, sorted by plugin identifier.
    pub outcomes: Vec<ExecutionOutcome>,
    /// `true` iff nothing failed or errored.
    pub overall_success: bool,
}

/// Folds outcomes into a summary.
///
/// The result does not depend on the order outcomes arrive in.
pub fn aggregate(outcomes: impl IntoIterator<Item = ExecutionOutcome>) -> RunSummary {
    let mut outcomes: Vec<_> = outcomes.into_iter().collect();
    outcomes.sort_by(|a, b| a.plugin.cmp(&b.plugin));

    let count = |status| outcomes.iter().filter(|o| o.status == status).count();
    let passed = count(PluginStatus::Passed);
    let failed = count(PluginStatus::Failed);
    let errored = count(PluginStatus::Errored);
    let skipped = count(PluginStatus::Skipped);
    let flaky = outcomes
        .iter()
        .filter(|o| o.status == PluginStatus::Passed && o.attempts > 1)
        .count();

    RunSummary {
        passed,
        failed,
        errored,
        skipped,
        flaky,
        overall_success: failed == 0 && errored == 0,
        outcomes,
    }
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn success(&self) -> bool {
        self.overall_success
    }

    /// Process exit code for this summary.
    pub fn exit_code(&self) -> i32 {
        if self.overall_success {
            EXIT_SUCCESS
        } else {
            EXIT_PLUGIN_FAILURES
        }
    }

    /// Outcomes that fail the run.
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_success())
    }

    pub fn with_status(&self, status: PluginStatus) -> impl Iterator<Item = &ExecutionOutcome> {
        self.outcomes.iter().filter(move |o| o.status == status)
    }

    /// Plugin time summed over all outcomes.
    pub fn total_duration(&self) -> Duration {
        self.outcomes.iter().map(|o| o.duration).sum()
    }
}
