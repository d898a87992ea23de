//! Runs plugin tests with pytest.
//!
//! pytest is asked for a JUnit XML report, which is the primary source of
//! test counts. If no report was written the final summary line
//! (`=== 3 passed, 1 failed in 0.52s ===`) is parsed instead.
//!
//! pytest exit codes decide whether the counts are trusted:
//!
//! | Exit | Meaning | Result |
//! |------|---------|--------|
//! | 0 | all tests passed | counts |
//! | 1 | some tests failed | counts |
//! | 2 | interrupted | [`RunnerError::Crashed`] |
//! | 3 | internal error | [`RunnerError::Crashed`] |
//! | 4 | usage error | [`RunnerError::Crashed`] |
//! | 5 | no tests collected | empty counts |

use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;

use super::{Command, EnvHandle, RunnerError, RunnerReport, TestRunner, exec, last_line};
use crate::logs::PluginLog;
use crate::plugin::TestCounts;

/// File name of the JUnit report inside the plugin workspace.
const JUNIT_FILE: &str = "junit.xml";

const EXIT_NO_TESTS: i32 = 5;

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=+ (.+?) in [\d.]+s(?: \([^)]*\))? =+$").expect("summary line pattern")
});

static SUMMARY_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) (passed|failed|errors?|skipped|xfailed|xpassed)")
        .expect("summary count pattern")
});

/// [`TestRunner`] that runs `python -m pytest` inside the plugin environment.
pub struct PytestRunner {
    extra_args: Vec<String>,
}

impl PytestRunner {
    pub fn new(extra_args: Vec<String>) -> Self {
        Self { extra_args }
    }
}

#[async_trait]
impl TestRunner for PytestRunner {
    fn name(&self) -> &str {
        "pytest"
    }

    async fn run(
        &self,
        env: &EnvHandle,
        target: &Path,
        log: &PluginLog,
    ) -> Result<RunnerReport, RunnerError> {
        let junit = env.workspace.join(JUNIT_FILE);

        let cmd = Command::new(env.python.to_string_lossy())
            .args(["-m", "pytest", "-p", "no:warnings"])
            .arg(format!("--junitxml={}", junit.display()))
            .args(self.extra_args.iter().cloned())
            .path_arg(target)
            .working_dir(&env.checkout);

        let result = exec(&cmd, log).await?;
        let summary = find_summary(&result.stdout);

        match result.exit_code {
            0 | 1 => {}
            EXIT_NO_TESTS => {
                return Ok(RunnerReport {
                    counts: TestCounts::default(),
                    duration: result.duration,
                    summary: summary.or_else(|| Some("no tests collected".to_string())),
                });
            }
            code => {
                return Err(RunnerError::Crashed(format!(
                    "pytest exited with {}: {}",
                    code,
                    last_line(&result.stdout)
                )));
            }
        }

        let counts = match tokio::fs::read_to_string(&junit).await {
            Ok(xml) => parse_junit_counts(&xml).map_err(RunnerError::UnreadableReport)?,
            Err(e) => {
                log.warn(format!("No JUnit report ({}), reading summary line", e));
                summary
                    .as_deref()
                    .map(parse_summary_counts)
                    .ok_or_else(|| {
                        RunnerError::UnreadableReport("no JUnit report and no summary line".into())
                    })?
            }
        };

        if result.exit_code != 0 && counts.failed == 0 && counts.errored == 0 {
            return Err(RunnerError::Crashed(format!(
                "pytest exited with {} but reported no failures",
                result.exit_code
            )));
        }

        Ok(RunnerReport {
            counts,
            duration: result.duration,
            summary,
        })
    }
}

/// Sums the counters of every `<testsuite>` in a JUnit report.
pub fn parse_junit_counts(xml: &str) -> Result<TestCounts, String> {
    let mut reader = Reader::from_str(xml);
    let mut totals = SuiteCounts::default();
    let mut suites = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"testsuite" => {
                totals.add(&SuiteCounts::from_element(&e)?)?;
                suites += 1;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(format!(
                    "invalid XML at position {}: {}",
                    reader.buffer_position(),
                    e
                ));
            }
        }
    }

    if suites == 0 {
        return Err("no <testsuite> element".to_string());
    }
    totals.into_counts()
}

#[derive(Debug, Default)]
struct SuiteCounts {
    tests: u32,
    failures: u32,
    errors: u32,
    skipped: u32,
}

impl SuiteCounts {
    fn from_element(e: &BytesStart<'_>) -> Result<Self, String> {
        let mut counts = Self::default();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let field = match attr.key.as_ref() {
                b"tests" => &mut counts.tests,
                b"failures" => &mut counts.failures,
                b"errors" => &mut counts.errors,
                b"skipped" | b"skips" => &mut counts.skipped,
                _ => continue,
            };
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            *field = value
                .trim()
                .parse()
                .map_err(|_| format!("bad count '{}'", value))?;
        }
        Ok(counts)
    }

    fn add(&mut self, other: &Self) -> Result<(), String> {
        let sum = |a: u32, b: u32| {
            a.checked_add(b)
                .ok_or_else(|| format!("count overflow adding {:?}", other))
        };
        self.tests = sum(self.tests, other.tests)?;
        self.failures = sum(self.failures, other.failures)?;
        self.errors = sum(self.errors, other.errors)?;
        self.skipped = sum(self.skipped, other.skipped)?;
        Ok(())
    }

    fn into_counts(self) -> Result<TestCounts, String> {
        let passed = self
            .failures
            .checked_add(self.errors)
            .and_then(|n| n.checked_add(self.skipped))
            .and_then(|not_passed| self.tests.checked_sub(not_passed))
            .ok_or_else(|| format!("inconsistent counts: {:?}", self))?;
        Ok(TestCounts {
            passed,
            failed: self.failures,
            errored: self.errors,
            skipped: self.skipped,
        })
    }
}

/// Returns the body of the last pytest summary line, e.g.
/// `"3 passed, 1 failed"`.
pub fn find_summary(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .find_map(|line| SUMMARY_LINE.captures(line.trim()))
        .map(|caps| caps[1].to_string())
}

/// Parses counts from a summary body. Expected failures count as skipped,
/// unexpected passes as passed.
pub fn parse_summary_counts(summary: &str) -> TestCounts {
    let mut counts = TestCounts::default();
    for caps in SUMMARY_COUNT.captures_iter(summary) {
        let n: u32 = caps[1].parse().unwrap_or(0);
        match &caps[2] {
            "passed" | "xpassed" => counts.passed = counts.passed.saturating_add(n),
            "failed" => counts.failed = counts.failed.saturating_add(n),
            "error" | "errors" => counts.errored = counts.errored.saturating_add(n),
            _ => counts.skipped = counts.skipped.saturating_add(n),
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites>
  <testsuite name="pytest" errors="1" failures="2" skipped="3" tests="10" time="1.234">
    <testcase classname="tests.test_a" name="test_ok" time="0.001"/>
    <testcase classname="tests.test_a" name="test_bad" time="0.002">
      <failure message="assert 1 == 2">assert 1 == 2</failure>
    </testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn test_parse_junit_counts() {
        let counts = parse_junit_counts(REPORT).unwrap();
        assert_eq!(
            counts,
            TestCounts {
                passed: 4,
                failed: 2,
                errored: 1,
                skipped: 3
            }
        );
    }

    #[test]
    fn test_parse_junit_sums_suites() {
        let xml = r#"<testsuites>
            <testsuite tests="2" failures="0" errors="0" skipped="0"/>
            <testsuite tests="3" failures="1" errors="0" skipped="1"></testsuite>
        </testsuites>"#;
        let counts = parse_junit_counts(xml).unwrap();
        assert_eq!(counts.passed, 3);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn test_parse_junit_rejects_garbage() {
        assert!(parse_junit_counts("<testsuites></testsuites>").is_err());
        assert!(parse_junit_counts(r#"<testsuite tests="x"/>"#).is_err());
        assert!(parse_junit_counts(r#"<testsuite tests="1" failures="2"/>"#).is_err());
    }

    #[test]
    fn test_parse_junit_rejects_overflowing_counts() {
        let single = r#"<testsuite tests="1" failures="4294967295" errors="1"/>"#;
        let err = parse_junit_counts(single).unwrap_err();
        assert!(err.contains("inconsistent counts"));

        let summed = r#"<testsuites>
  <testsuite tests="4294967295" failures="4294967295"/>
  <testsuite tests="1" failures="1"/>
</testsuites>"#;
        let err = parse_junit_counts(summed).unwrap_err();
        assert!(err.contains("count overflow"));
    }

    #[test]
    fn test_find_summary() {
        let stdout = "collected 4 items\n\ntests/test_a.py ..F.\n\
                      =========== 3 passed, 1 failed, 2 warnings in 0.52s ===========\n";
        assert_eq!(
            find_summary(stdout).as_deref(),
            Some("3 passed, 1 failed, 2 warnings")
        );

        let slow = "==== 12 passed in 75.20s (0:01:15) ====";
        assert_eq!(find_summary(slow).as_deref(), Some("12 passed"));

        assert_eq!(find_summary("no summary here"), None);
    }

    #[test]
    fn test_parse_summary_counts() {
        let counts =
            parse_summary_counts("3 passed, 1 failed, 2 errors, 1 skipped, 1 xfailed, 1 xpassed");
        assert_eq!(
            counts,
            TestCounts {
                passed: 4,
                failed: 1,
                errored: 2,
                skipped: 2
            }
        );

        assert_eq!(parse_summary_counts("1 error").errored, 1);
        assert_eq!(parse_summary_counts("no tests ran").total(), 0);
    }
}
