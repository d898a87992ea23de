//! Run reporting.
//!
//! Reporters observe a run through the [`Reporter`] events. Several can be
//! combined with [`MultiReporter`].
//!
//! | Reporter | Module | Output |
//! |----------|--------|--------|
//! | [`ConsoleReporter`] | [`console`] | Progress bar, summary, logs of failing plugins |
//! | [`JUnitReporter`] | [`junit`] | JUnit XML, one testcase per plugin |
//! | [`JsonReporter`] | [`json`] | `report.json` with run metadata |

pub mod console;
pub mod json;
pub mod junit;

use async_trait::async_trait;

use crate::plugin::{ExecutionOutcome, PluginSpec};
use crate::shard::ShardPlan;
use crate::summary::RunSummary;

pub use self::console::ConsoleReporter;
pub use json::JsonReporter;
pub use junit::JUnitReporter;

/// Receives events while a run progresses.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once this node's shard is known, before any plugin runs.
    async fn on_plan_ready(&self, plan: &ShardPlan);

    /// Called when a plugin attempt starts.
    async fn on_plugin_start(&self, plugin: &PluginSpec);

    /// Called with the final outcome of each plugin.
    async fn on_plugin_complete(&self, outcome: &ExecutionOutcome);

    /// Called once with the aggregated result.
    async fn on_run_complete(&self, summary: &RunSummary);
}

/// Discards every event.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_plan_ready(&self, _plan: &ShardPlan) {}
    async fn on_plugin_start(&self, _plugin: &PluginSpec) {}
    async fn on_plugin_complete(&self, _outcome: &ExecutionOutcome) {}
    async fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Forwards every event to each inner reporter, in insertion order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_plan_ready(&self, plan: &ShardPlan) {
        for reporter in &self.reporters {
            reporter.on_plan_ready(plan).await;
        }
    }

    async fn on_plugin_start(&self, plugin: &PluginSpec) {
        for reporter in &self.reporters {
            reporter.on_plugin_start(plugin).await;
        }
    }

    async fn on_plugin_complete(&self, outcome: &ExecutionOutcome) {
        for reporter in &self.reporters {
            reporter.on_plugin_complete(outcome).await;
        }
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        for reporter in &self.reporters {
            reporter.on_run_complete(summary).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records events as strings.
    #[derive(Default)]
    pub struct RecordingReporter {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl Reporter for RecordingReporter {
        async fn on_plan_ready(&self, plan: &ShardPlan) {
            self.push(format!("plan:{}", plan.len()));
        }

        async fn on_plugin_start(&self, plugin: &PluginSpec) {
            self.push(format!("start:{}", plugin.id));
        }

        async fn on_plugin_complete(&self, outcome: &ExecutionOutcome) {
            self.push(format!("complete:{}:{}", outcome.plugin, outcome.status));
        }

        async fn on_run_complete(&self, summary: &RunSummary) {
            self.push(format!("run:{}", summary.total()));
        }
    }

    #[async_trait]
    impl<R: Reporter> Reporter for std::sync::Arc<R> {
        async fn on_plan_ready(&self, plan: &ShardPlan) {
            (**self).on_plan_ready(plan).await
        }

        async fn on_plugin_start(&self, plugin: &PluginSpec) {
            (**self).on_plugin_start(plugin).await
        }

        async fn on_plugin_complete(&self, outcome: &ExecutionOutcome) {
            (**self).on_plugin_complete(outcome).await
        }

        async fn on_run_complete(&self, summary: &RunSummary) {
            (**self).on_run_complete(summary).await
        }
    }
}
