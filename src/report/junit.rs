//! JUnit XML report, one `<testcase>` per plugin.
//!
//! CI systems render this like any other test report, so a failing plugin
//! shows up as a failing test named after the plugin:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" skipped="0" time="42.000">
//!   <testsuite name="plugin-tests" tests="3" failures="1" errors="1" skipped="0" time="42.000">
//!     <testcase classname="plugins" name="nomad-plugin-a" time="20.000"/>
//!     <testcase classname="plugins" name="nomad-plugin-b" time="12.000">
//!       <failure message="1 failed, 0 errored, 9 passed" type="test">log: logs/nomad-plugin-b/test_output.log</failure>
//!     </testcase>
//!     <testcase classname="plugins" name="nomad-plugin-c" time="10.000">
//!       <error message="provision timed out after 600s" type="provision"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::Reporter;
use crate::plugin::{ExecutionOutcome, PluginSpec, PluginStatus};
use crate::shard::ShardPlan;
use crate::summary::RunSummary;

const DEFAULT_SUITE_NAME: &str = "plugin-tests";
const CLASSNAME: &str = "plugins";

/// Writes a JUnit XML file when the run completes.
///
/// Parent directories are created as needed.
///
/// ```
/// use plugin_tests::report::JUnitReporter;
///
/// let reporter = JUnitReporter::new("plugin-test-results/junit.xml".into())
///     .with_testsuite_name("nomad-distro-plugins");
/// ```
pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: DEFAULT_SUITE_NAME.to_string(),
        }
    }

    /// Sets the `<testsuite name>` attribute.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }
}

/// Renders a summary as JUnit XML.
pub fn render(summary: &RunSummary, suite_name: &str) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let tests = summary.total().to_string();
    let failures = summary.failed.to_string();
    let errors = summary.errored.to_string();
    let skipped = summary.skipped.to_string();
    let time = format!("{:.3}", summary.total_duration().as_secs_f64());

    let mut testsuites = BytesStart::new("testsuites");
    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", suite_name));
    for element in [&mut testsuites, &mut testsuite] {
        element.push_attribute(("tests", tests.as_str()));
        element.push_attribute(("failures", failures.as_str()));
        element.push_attribute(("errors", errors.as_str()));
        element.push_attribute(("skipped", skipped.as_str()));
        element.push_attribute(("time", time.as_str()));
    }
    writer.write_event(Event::Start(testsuites))?;
    writer.write_event(Event::Start(testsuite))?;

    for outcome in &summary.outcomes {
        write_testcase(&mut writer, outcome)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    outcome: &ExecutionOutcome,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", CLASSNAME));
    testcase.push_attribute(("name", outcome.plugin.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", outcome.duration.as_secs_f64()).as_str(),
    ));

    let child = match outcome.status {
        PluginStatus::Passed => None,
        PluginStatus::Failed => Some("failure"),
        PluginStatus::Errored => Some("error"),
        PluginStatus::Skipped => Some("skipped"),
    };

    let Some(child) = child else {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    };

    writer.write_event(Event::Start(testcase))?;

    let mut element = BytesStart::new(child);
    if let Some(reason) = &outcome.reason {
        element.push_attribute(("message", strip_invalid_chars(reason).as_str()));
    }
    if let Some(stage) = outcome.stage
        && outcome.status != PluginStatus::Skipped
    {
        element.push_attribute(("type", stage.as_str()));
    }

    match &outcome.log_path {
        Some(path) if outcome.status != PluginStatus::Skipped => {
            writer.write_event(Event::Start(element))?;
            let text = strip_invalid_chars(&format!("log: {}", path.display()));
            writer.write_event(Event::Text(BytesText::new(&text)))?;
            writer.write_event(Event::End(BytesEnd::new(child)))?;
        }
        _ => writer.write_event(Event::Empty(element))?,
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_plan_ready(&self, _plan: &ShardPlan) {}

    async fn on_plugin_start(&self, _plugin: &PluginSpec) {}

    async fn on_plugin_complete(&self, _outcome: &ExecutionOutcome) {}

    async fn on_run_complete(&self, summary: &RunSummary) {
        let xml = match render(summary, &self.testsuite_name) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
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

        match std::fs::write(&self.output_path, xml) {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {}", e),
        }
    }
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn strip_invalid_chars(s: &str) -> String {
    s.chars()
        .filter(|c| {
            matches!(
                c,
                '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::plugin::Stage;
    use crate::provider::pytest::parse_junit_counts;
    use crate::summary::aggregate;

    fn summary() -> RunSummary {
        aggregate(vec![
            ExecutionOutcome::new("plugin-a", PluginStatus::Passed)
                .with_duration(Duration::from_secs(2)),
            ExecutionOutcome::new("plugin-b", PluginStatus::Failed)
                .with_stage(Stage::Test)
                .with_reason("1 failed, 0 errored, 2 passed")
                .with_log_path("logs/plugin-b/test_output.log"),
            ExecutionOutcome::new("plugin-c", PluginStatus::Errored)
                .with_stage(Stage::Provision)
                .with_reason("failed to install <plugin-c>: \"no\" & \u{1}bad"),
            ExecutionOutcome::new("plugin-d", PluginStatus::Skipped)
                .with_reason("no source repository"),
        ])
    }

    #[test]
    fn test_render_structure() {
        let xml = render(&summary(), "suite").unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            r#"<testsuite name="suite" tests="4" failures="1" errors="1" skipped="1""#
        ));
        assert!(xml.contains(r#"<testcase classname="plugins" name="plugin-a" time="2.000"/>"#));
        assert!(xml.contains(concat!(
            r#"<failure message="1 failed, 0 errored, 2 passed" type="test">"#,
            "log: logs/plugin-b/test_output.log</failure>"
        )));
        assert!(xml.contains(r#"<skipped message="no source repository"/>"#));
    }

    #[test]
    fn test_render_escapes_once_and_strips_invalid() {
        let xml = render(&summary(), "suite").unwrap();
        assert!(xml.contains("&lt;plugin-c&gt;: &quot;no&quot; &amp; bad"));
        assert!(!xml.contains("&amp;lt;"));
        assert!(!xml.contains('\u{1}'));
    }

    #[test]
    fn test_render_is_readable_as_junit() {
        let xml = render(&summary(), "suite").unwrap();
        let counts = parse_junit_counts(&xml).unwrap();
        assert_eq!(counts.passed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.errored, 1);
        assert_eq!(counts.skipped, 1);
    }

    #[tokio::test]
    async fn test_reporter_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("junit.xml");
        let reporter = JUnitReporter::new(path.clone());

        reporter.on_run_complete(&summary()).await;

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("plugin-b"));
    }
}
