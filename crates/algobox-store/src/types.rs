use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::StoreError;

/// Status of an execution.
///
/// Statuses only move forward: PENDING, STARTED, RUNNING, then one of the
/// terminal COMPLETED or FAILED. Any stage may jump straight to a terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
  Pending,
  Started,
  Running,
  Completed,
  Failed,
}

impl ExecutionStatus {
  pub const ALL: [ExecutionStatus; 5] = [
    Self::Pending,
    Self::Started,
    Self::Running,
    Self::Completed,
    Self::Failed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "PENDING",
      Self::Started => "STARTED",
      Self::Running => "RUNNING",
      Self::Completed => "COMPLETED",
      Self::Failed => "FAILED",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }

  fn rank(&self) -> u8 {
    match self {
      Self::Pending => 0,
      Self::Started => 1,
      Self::Running => 2,
      Self::Completed | Self::Failed => 3,
    }
  }

  /// Whether a record in this status may move to `next`.
  pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
    !self.is_terminal() && next.rank() > self.rank()
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ExecutionStatus {
  type Err = StoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|status| status.as_str().eq_ignore_ascii_case(s))
      .ok_or_else(|| {
        StoreError::Validation(format!(
          "invalid status '{}', expected one of PENDING, STARTED, RUNNING, COMPLETED, FAILED",
          s
        ))
      })
  }
}

/// Durable state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
  pub execution_id: String,
  pub algorithm_id: String,
  pub input_dataset_ids: Vec<String>,
  #[serde(default)]
  pub execution_device_override: Option<String>,
  #[serde(default)]
  pub additional_parameters: serde_json::Map<String, serde_json::Value>,
  #[serde(default)]
  pub session_token: Option<String>,
  #[serde(default)]
  pub output_dataset_ids: Vec<String>,
  pub status: ExecutionStatus,
  pub progress: f64,
  pub time_started: DateTime<Utc>,
  #[serde(default)]
  pub time_completed: Option<DateTime<Utc>>,
  #[serde(default)]
  pub log: String,
}

impl ExecutionRecord {
  /// A freshly accepted execution: PENDING, no progress, started now.
  pub fn new(
    execution_id: impl Into<String>,
    algorithm_id: impl Into<String>,
    input_dataset_ids: Vec<String>,
  ) -> Self {
    Self {
      execution_id: execution_id.into(),
      algorithm_id: algorithm_id.into(),
      input_dataset_ids,
      execution_device_override: None,
      additional_parameters: serde_json::Map::new(),
      session_token: None,
      output_dataset_ids: Vec::new(),
      status: ExecutionStatus::Pending,
      progress: 0.0,
      time_started: Utc::now(),
      time_completed: None,
      log: String::new(),
    }
  }

  pub fn with_device_override(mut self, device: impl Into<String>) -> Self {
    self.execution_device_override = Some(device.into());
    self
  }

  pub fn with_parameters(mut self, parameters: serde_json::Map<String, serde_json::Value>) -> Self {
    self.additional_parameters = parameters;
    self
  }

  pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
    self.session_token = Some(token.into());
    self
  }

  /// Apply a single-field update.
  ///
  /// Returns `Ok(false)` when the update leaves the record unchanged, either
  /// because the value is already stored or because it is a progress value
  /// lower than the stored one. Terminal records reject every change.
  pub fn apply(&mut self, update: &RecordUpdate) -> Result<bool, StoreError> {
    if let RecordUpdate::Progress(p) = update {
      validate_progress(*p)?;
    }

    if self.status.is_terminal() && !self.is_noop(update) {
      return Err(StoreError::Terminal {
        execution_id: self.execution_id.clone(),
        status: self.status,
        field: update.field(),
      });
    }

    match update {
      RecordUpdate::Status(next) => {
        if *next == self.status {
          return Ok(false);
        }
        if !self.status.can_transition_to(*next) {
          return Err(StoreError::Validation(format!(
            "execution {} cannot move from {} to {}",
            self.execution_id, self.status, next
          )));
        }
        self.status = *next;
      }
      RecordUpdate::Progress(p) => {
        if *p < self.progress {
          warn!(
            execution_id = %self.execution_id,
            stored = self.progress,
            requested = *p,
            "ignoring progress lower than the stored value"
          );
          return Ok(false);
        }
        if *p == self.progress {
          return Ok(false);
        }
        self.progress = *p;
      }
      RecordUpdate::OutputDatasetIds(ids) => {
        if *ids == self.output_dataset_ids {
          return Ok(false);
        }
        self.output_dataset_ids = ids.clone();
      }
      RecordUpdate::TimeCompleted(time) => {
        if self.time_completed == Some(*time) {
          return Ok(false);
        }
        self.time_completed = Some(*time);
      }
      RecordUpdate::SessionToken(token) => {
        if *token == self.session_token {
          return Ok(false);
        }
        self.session_token = token.clone();
      }
      RecordUpdate::Log(log) => {
        if *log == self.log {
          return Ok(false);
        }
        self.log = log.clone();
      }
    }
    Ok(true)
  }

  fn is_noop(&self, update: &RecordUpdate) -> bool {
    match update {
      RecordUpdate::Status(s) => *s == self.status,
      RecordUpdate::Progress(p) => *p == self.progress,
      RecordUpdate::OutputDatasetIds(ids) => *ids == self.output_dataset_ids,
      RecordUpdate::TimeCompleted(t) => self.time_completed == Some(*t),
      RecordUpdate::SessionToken(t) => *t == self.session_token,
      RecordUpdate::Log(l) => *l == self.log,
    }
  }
}

/// A write to one field of an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
  Status(ExecutionStatus),
  Progress(f64),
  OutputDatasetIds(Vec<String>),
  TimeCompleted(DateTime<Utc>),
  SessionToken(Option<String>),
  /// Replaces the accumulated log text.
  Log(String),
}

impl RecordUpdate {
  pub fn field(&self) -> &'static str {
    match self {
      Self::Status(_) => "status",
      Self::Progress(_) => "progress",
      Self::OutputDatasetIds(_) => "output_dataset_ids",
      Self::TimeCompleted(_) => "time_completed",
      Self::SessionToken(_) => "session_token",
      Self::Log(_) => "log",
    }
  }
}

/// Progress must be a finite number in `[0, 1]`.
pub fn validate_progress(progress: f64) -> Result<(), StoreError> {
  if !progress.is_finite() || !(0.0..=1.0).contains(&progress) {
    return Err(StoreError::Validation(format!(
      "progress must be between 0.0 and 1.0, got {}",
      progress
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record() -> ExecutionRecord {
    ExecutionRecord::new("exec-1", "algo", vec!["in-1".to_string()])
  }

  #[test]
  fn test_new_record_is_pending() {
    let r = record();
    assert_eq!(r.status, ExecutionStatus::Pending);
    assert_eq!(r.progress, 0.0);
    assert!(r.output_dataset_ids.is_empty());
    assert!(r.time_completed.is_none());
  }

  #[test]
  fn test_status_serializes_uppercase() {
    let json = serde_json::to_string(&ExecutionStatus::Completed).unwrap();
    assert_eq!(json, "\"COMPLETED\"");
    assert_eq!("running".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Running);
    assert!("DONE".parse::<ExecutionStatus>().is_err());
  }

  #[test]
  fn test_status_moves_forward_only() {
    let mut r = record();
    assert!(r.apply(&RecordUpdate::Status(ExecutionStatus::Started)).unwrap());
    assert!(r.apply(&RecordUpdate::Status(ExecutionStatus::Running)).unwrap());
    assert!(!r.apply(&RecordUpdate::Status(ExecutionStatus::Running)).unwrap());

    let err = r
      .apply(&RecordUpdate::Status(ExecutionStatus::Pending))
      .unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(r.status, ExecutionStatus::Running);
  }

  #[test]
  fn test_pending_may_fail_directly() {
    let mut r = record();
    assert!(r.apply(&RecordUpdate::Status(ExecutionStatus::Failed)).unwrap());
  }

  #[test]
  fn test_terminal_record_is_frozen() {
    let mut r = record();
    r.apply(&RecordUpdate::Progress(1.0)).unwrap();
    r.apply(&RecordUpdate::Status(ExecutionStatus::Completed))
      .unwrap();

    let err = r
      .apply(&RecordUpdate::Status(ExecutionStatus::Running))
      .unwrap_err();
    assert!(matches!(err, StoreError::Terminal { .. }));

    let err = r.apply(&RecordUpdate::Log("late".to_string())).unwrap_err();
    assert!(matches!(err, StoreError::Terminal { field: "log", .. }));

    // Writing what is already there is not a change.
    assert!(!r.apply(&RecordUpdate::Progress(1.0)).unwrap());
  }

  #[test]
  fn test_progress_validation_and_monotonicity() {
    let mut r = record();
    assert!(r.apply(&RecordUpdate::Progress(0.3)).unwrap());

    assert!(r.apply(&RecordUpdate::Progress(1.5)).is_err());
    assert!(r.apply(&RecordUpdate::Progress(-0.1)).is_err());
    assert!(r.apply(&RecordUpdate::Progress(f64::NAN)).is_err());
    assert_eq!(r.progress, 0.3);

    assert!(!r.apply(&RecordUpdate::Progress(0.1)).unwrap());
    assert_eq!(r.progress, 0.3);

    assert!(r.apply(&RecordUpdate::Progress(0.7)).unwrap());
    assert_eq!(r.progress, 0.7);
  }

  #[test]
  fn test_record_json_roundtrip_with_defaults() {
    let json = r#"{
      "execution_id": "e",
      "algorithm_id": "a",
      "input_dataset_ids": ["x"],
      "status": "STARTED",
      "progress": 0.5,
      "time_started": "2024-01-01T00:00:00Z"
    }"#;
    let r: ExecutionRecord = serde_json::from_str(json).unwrap();
    assert_eq!(r.status, ExecutionStatus::Started);
    assert!(r.session_token.is_none());
    assert!(r.log.is_empty());
  }
}
