//! Terminal output: progress while plugins run, a summary at the end.

use std::sync::Mutex;

use async_trait::async_trait;
use console::{StyledObject, style};
use indicatif::{ProgressBar, ProgressStyle};

use super::Reporter;
use crate::logs::read_log;
use crate::plugin::{ExecutionOutcome, PluginSpec, PluginStatus};
use crate::shard::ShardPlan;
use crate::summary::RunSummary;

/// Progress bar, per-plugin status lines and the final summary.
///
/// Logs of failed and errored plugins are printed after the run, so CI
/// output contains everything needed to debug them. In verbose mode every
/// plugin's log is printed.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    /// Prints above the progress bar. `suspend` also prints when the bar is
    /// hidden (no terminal), unlike `ProgressBar::println`.
    fn println(&self, line: String) {
        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.suspend(|| println!("{}", line));
        } else {
            println!("{}", line);
        }
    }
}

fn status_label(status: PluginStatus) -> StyledObject<&'static str> {
    match status {
        PluginStatus::Passed => style("PASS").green(),
        PluginStatus::Failed => style("FAIL").red(),
        PluginStatus::Errored => style("ERR ").red().bold(),
        PluginStatus::Skipped => style("SKIP").yellow(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_plan_ready(&self, plan: &ShardPlan) {
        let slot = plan.slot();
        if plan.is_empty() {
            println!(
                "Node {}/{}: no plugins assigned to this node",
                slot.number(),
                slot.count
            );
            return;
        }
        println!(
            "Node {}/{}: testing {} plugins",
            slot.number(),
            slot.count,
            plan.len()
        );

        let pb = ProgressBar::new(plan.len() as u64);
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(bar_style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_plugin_start(&self, plugin: &PluginSpec) {
        if self.verbose {
            self.println(format!("Testing: {}", plugin.id));
        }
    }

    async fn on_plugin_complete(&self, outcome: &ExecutionOutcome) {
        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(1);
            pb.set_message(outcome.plugin.clone());
        }

        if self.verbose || !outcome.status.is_success() {
            let mut line = format!(
                "{} {} ({:.1}s)",
                status_label(outcome.status),
                outcome.plugin,
                outcome.duration.as_secs_f64()
            );
            if let Some(reason) = &outcome.reason {
                line.push_str(&format!(" {}", style(reason).dim()));
            }
            self.println(line);
        }
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        for outcome in &summary.outcomes {
            if !(self.verbose || !outcome.status.is_success()) {
                continue;
            }
            let Some(path) = &outcome.log_path else {
                continue;
            };
            match read_log(path) {
                Ok(content) => {
                    println!();
                    let header = format!("--- Log output for {} ---", outcome.plugin);
                    println!("{}", style(header).bold());
                    print!("{}", content);
                    let footer = format!("--- End of log for {} ---", outcome.plugin);
                    println!("{}", style(footer).bold());
                }
                Err(e) => {
                    println!("Could not read log {}: {}", path.display(), e);
                }
            }
        }

        println!();
        println!("Plugin Results:");
        println!("  Total:   {}", summary.total());
        println!("  Passed:  {}", style(summary.passed).green());
        println!("  Failed:  {}", style(summary.failed).red());
        println!("  Errored: {}", style(summary.errored).red());
        println!("  Skipped: {}", style(summary.skipped).yellow());
        if summary.flaky > 0 {
            println!("  Flaky:   {}", style(summary.flaky).yellow());
        }
        println!("  Duration: {:.1}s", summary.total_duration().as_secs_f64());

        let flaky: Vec<_> = summary
            .with_status(PluginStatus::Passed)
            .filter(|o| o.attempts > 1)
            .collect();
        if !flaky.is_empty() {
            println!();
            println!("Flaky plugins (passed on retry):");
            for outcome in flaky {
                println!("  - {} ({} attempts)", outcome.plugin, outcome.attempts);
            }
        }

        println!();
        if summary.success() {
            if summary.total() == 0 {
                println!("{}", style("No plugins were tested on this node.").green().bold());
            } else {
                println!("{}", style("All plugins passed!").green().bold());
            }
            return;
        }

        println!("{}", style("Some plugins failed.").red().bold());
        println!();
        println!("Failed plugins:");
        for outcome in summary.failures() {
            println!("  - {} [{}]", outcome.plugin, outcome.status);
            if let Some(reason) = &outcome.reason {
                println!("    {}", style(reason).dim());
            }
        }
    }
}
