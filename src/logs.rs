//! Per-plugin log files.
//!
//! Every plugin gets `<log_dir>/<plugin>/test_output.log`. Stage messages
//! are written with a timestamp and level; output of child processes
//! (git, uv, pytest) is copied verbatim. Stage messages are mirrored to
//! `tracing`, raw child output only at TRACE level.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::plugin::path_component;

/// File name of a plugin log inside its directory.
pub const LOG_FILE_NAME: &str = "test_output.log";

/// Location of a plugin's log for a given log directory.
pub fn log_path(log_dir: &Path, plugin: &str) -> PathBuf {
    log_dir.join(path_component(plugin)).join(LOG_FILE_NAME)
}

/// Append-only log owned by one plugin pipeline.
pub struct PluginLog {
    plugin: String,
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl PluginLog {
    /// Opens the plugin's log file, creating its directory.
    ///
    /// With `append == false` any previous log is truncated; retries append
    /// to the log of the first attempt.
    pub fn create(log_dir: &Path, plugin: &str, append: bool) -> std::io::Result<Self> {
        let path = log_path(log_dir, plugin);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;

        Ok(Self {
            plugin: plugin.to_string(),
            path: Some(path),
            file: Some(Mutex::new(file)),
        })
    }

    /// A log that only forwards to `tracing`.
    pub fn detached(plugin: &str) -> Self {
        Self {
            plugin: plugin.to_string(),
            path: None,
            file: None,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, msg: impl Display) {
        tracing::info!("[{}] {}", self.plugin, msg);
        self.write_record("INFO", &msg);
    }

    pub fn warn(&self, msg: impl Display) {
        tracing::warn!("[{}] {}", self.plugin, msg);
        self.write_record("WARNING", &msg);
    }

    pub fn error(&self, msg: impl Display) {
        tracing::error!("[{}] {}", self.plugin, msg);
        self.write_record("ERROR", &msg);
    }

    pub fn debug(&self, msg: impl Display) {
        tracing::debug!("[{}] {}", self.plugin, msg);
        self.write_record("DEBUG", &msg);
    }

    /// Copies one line of child process output.
    pub fn output(&self, line: &str) {
        tracing::trace!("[{}] {}", self.plugin, line);
        self.write_line(line);
    }

    fn write_record(&self, level: &str, msg: &dyn Display) {
        let line = format!(
            "{} - {} - {} - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            self.plugin,
            level,
            msg
        );
        self.write_line(&line);
    }

    fn write_line(&self, line: &str) {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            // Logging must never fail the pipeline.
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Reads a plugin log back, for console output.
pub fn read_log(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}
