use std::fmt;
use std::sync::Mutex;

use chrono::Local;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Info,
  Warning,
  Error,
}

impl fmt::Display for Level {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Info => "INFO",
      Self::Warning => "WARNING",
      Self::Error => "ERROR",
    })
  }
}

/// Text log of one execution.
///
/// Every message is emitted as a tracing event and appended to a buffer as
/// `YYYY-MM-DD HH:MM:SS LEVEL message`. The buffer is what ends up in the
/// execution record's `log` field.
#[derive(Debug)]
pub struct TaskLog {
  execution_id: String,
  algorithm: Mutex<Option<String>>,
  buffer: Mutex<String>,
}

impl TaskLog {
  pub fn new(execution_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      algorithm: Mutex::new(None),
      buffer: Mutex::new(String::new()),
    }
  }

  /// Tag subsequent tracing events with an algorithm label.
  pub fn bind_algorithm(&self, label: impl Into<String>) {
    *self.algorithm.lock().unwrap_or_else(|e| e.into_inner()) = Some(label.into());
  }

  pub fn info(&self, message: impl AsRef<str>) {
    self.write(Level::Info, message.as_ref());
  }

  pub fn warn(&self, message: impl AsRef<str>) {
    self.write(Level::Warning, message.as_ref());
  }

  pub fn error(&self, message: impl AsRef<str>) {
    self.write(Level::Error, message.as_ref());
  }

  pub fn write(&self, level: Level, message: &str) {
    let algorithm = self
      .algorithm
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
      .unwrap_or_default();
    match level {
      Level::Info => info!(execution_id = %self.execution_id, algorithm = %algorithm, "{}", message),
      Level::Warning => {
        warn!(execution_id = %self.execution_id, algorithm = %algorithm, "{}", message)
      }
      Level::Error => {
        error!(execution_id = %self.execution_id, algorithm = %algorithm, "{}", message)
      }
    }

    let line = format!(
      "{} {} {}\n",
      Local::now().format("%Y-%m-%d %H:%M:%S"),
      level,
      message
    );
    self
      .buffer
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push_str(&line);
  }

  /// Everything logged so far.
  pub fn contents(&self) -> String {
    self.buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lines_are_timestamped() {
    let log = TaskLog::new("exec-1");
    log.info("Starting execution.");
    log.warn("Running on CPU.");
    log.error("bad input");

    let contents = log.contents();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with(" INFO Starting execution."));
    assert!(lines[1].ends_with(" WARNING Running on CPU."));
    assert!(lines[2].ends_with(" ERROR bad input"));
    // "YYYY-MM-DD HH:MM:SS" prefix
    assert_eq!(lines[0].as_bytes()[4], b'-');
    assert_eq!(lines[0].as_bytes()[13], b':');
  }
}
