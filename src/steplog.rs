use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use log::warn;

use crate::error::MigrateError;

/// Per-step execution log.
///
/// One file per plan step, named `<id>[_down]_<utc-timestamp>.log` inside
/// the configured log directory. The file name (not the full path) is the
/// `log_ref` stored on the migration record, so external consumers can
/// locate the log relative to whatever log sink they configured. The file
/// is owned by the executor for exactly one step and is flushed after
/// every line so a crashed run leaves a usable log behind.
pub struct StepLog {
    file_name: String,
    file: File,
}

impl StepLog {
    pub fn create(log_dir: &Path, id: &str, suffix: Option<&str>) -> Result<Self, MigrateError> {
        fs::create_dir_all(log_dir)?;
        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let file_name = match suffix {
            Some(suffix) => format!("{id}_{suffix}_{timestamp}.log"),
            None => format!("{id}_{timestamp}.log"),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(&file_name))?;
        Ok(StepLog { file_name, file })
    }

    /// The `log_ref` value for this step.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// A second handle on the same file, for routing server notices.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>, MigrateError> {
        Ok(Box::new(self.file.try_clone()?))
    }

    /// Appends one line, best effort. Losing a log line must never fail a
    /// migration step.
    pub fn log(&mut self, message: &str) {
        if writeln!(self.file, "{message}")
            .and_then(|_| self.file.flush())
            .is_err()
        {
            warn!("failed to write step log line: {message}");
        }
    }
}
