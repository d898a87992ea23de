//! Child process execution with output captured to the plugin log.

use std::process::Stdio;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;

use super::Command;
use crate::logs::PluginLog;

/// A child process could not be run at all.
///
/// A process that runs and exits non-zero is not an error; see
/// [`ExecResult::success`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} {stream} was not captured")]
    NotCaptured {
        program: String,
        stream: &'static str,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Result of a finished child process.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code, or `-1` if the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Runs `cmd` to completion.
///
/// The command line and every line of stdout and stderr are written to
/// `log` as they arrive. The child is killed if the returned future is
/// dropped, which is how stage timeouts and cancellation stop it.
pub async fn exec(cmd: &Command, log: &PluginLog) -> Result<ExecResult, ProcessError> {
    log.info(format!("$ {}", cmd.to_shell_string()));
    let start = Instant::now();

    let mut process = tokio::process::Command::new(&cmd.program);
    process
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &cmd.working_dir {
        process.current_dir(dir);
    }
    for (key, value) in &cmd.env {
        process.env(key, value);
    }

    let mut child = process.spawn().map_err(|source| ProcessError::Spawn {
        program: cmd.program.clone(),
        source,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| ProcessError::NotCaptured {
        program: cmd.program.clone(),
        stream: "stdout",
    })?;
    let stderr = child.stderr.take().ok_or_else(|| ProcessError::NotCaptured {
        program: cmd.program.clone(),
        stream: "stderr",
    })?;

    let stdout_stream = LinesStream::new(BufReader::new(stdout).lines())
        .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
    let stderr_stream = LinesStream::new(BufReader::new(stderr).lines())
        .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
    let mut combined = stream::select(stdout_stream, stderr_stream);

    let mut out = String::new();
    let mut err = String::new();
    while let Some(line) = combined.next().await {
        let (buf, text) = match &line {
            OutputLine::Stdout(text) => (&mut out, text),
            OutputLine::Stderr(text) => (&mut err, text),
        };
        log.output(text);
        buf.push_str(text);
        buf.push('\n');
    }

    let status = child.wait().await.map_err(|source| ProcessError::Wait {
        program: cmd.program.clone(),
        source,
    })?;

    let result = ExecResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: out,
        stderr: err,
        duration: start.elapsed(),
    };
    log.debug(format!(
        "{} exited with {} after {:.1}s",
        cmd.program,
        result.exit_code,
        result.duration.as_secs_f64()
    ));

    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let log = PluginLog::create(dir.path(), "p", false).unwrap();

        let cmd = Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = exec(&cmd, &log).await.unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.contains("$ sh -c"));
        assert!(content.contains("\nout\n"));
        assert!(content.contains("\nerr\n"));
    }

    #[tokio::test]
    async fn test_exec_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let log = PluginLog::detached("p");

        let cmd = Command::new("sh")
            .args(["-c", "pwd; echo $PLUGIN_TESTS_MARKER"])
            .working_dir(dir.path())
            .env("PLUGIN_TESTS_MARKER", "marker-value");
        let result = exec(&cmd, &log).await.unwrap();

        assert!(result.success());
        let canonical = dir.path().canonicalize().unwrap();
        assert!(result.stdout.contains(canonical.to_str().unwrap()));
        assert!(result.stdout.contains("marker-value"));
    }

    #[tokio::test]
    async fn test_exec_missing_program() {
        let log = PluginLog::detached("p");
        let cmd = Command::new("definitely-not-a-real-program-4711");
        let err = exec(&cmd, &log).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
