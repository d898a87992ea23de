//! Machine-readable run report.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Reporter;
use crate::plugin::{ExecutionOutcome, PluginSpec};
use crate::shard::{NodeSlot, ShardPlan};
use crate::summary::RunSummary;

/// Writes `report.json` when the run completes.
pub struct JsonReporter {
    output_path: PathBuf,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    slot: Mutex<Option<NodeSlot>>,
}

/// Document written to disk.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub node_index: Option<usize>,
    pub node_count: Option<usize>,
    #[serde(flatten)]
    pub summary: &'a RunSummary,
}

impl JsonReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            slot: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn build<'a>(&self, summary: &'a RunSummary) -> JsonReport<'a> {
        let slot = self.slot.lock().ok().and_then(|slot| *slot);
        JsonReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            node_index: slot.map(|s| s.index),
            node_count: slot.map(|s| s.count),
            summary,
        }
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_plan_ready(&self, plan: &ShardPlan) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(plan.slot());
        }
    }

    async fn on_plugin_start(&self, _plugin: &PluginSpec) {}

    async fn on_plugin_complete(&self, _outcome: &ExecutionOutcome) {}

    async fn on_run_complete(&self, summary: &RunSummary) {
        let json = match serde_json::to_string_pretty(&self.build(summary)) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize JSON report: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        match std::fs::write(&self.output_path, json) {
            Ok(()) => tracing::info!("JSON report written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JSON report: {}", e),
        }
    }
}
