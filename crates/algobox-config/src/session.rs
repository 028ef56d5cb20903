use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits for client-opted task sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
  /// Live sessions per process; the least recently used one is dropped beyond this.
  pub max_sessions: usize,
  /// Items kept per session.
  pub max_items_per_session: usize,
  /// Optional memory cap per session, in megabytes.
  pub max_memory_mb: Option<u64>,
  /// Sessions older than this (from creation) are purged.
  pub expire_hours: u64,
}

impl SessionSettings {
  pub fn max_memory_bytes(&self) -> Option<u64> {
    self.max_memory_mb.map(|mb| mb * 1024 * 1024)
  }

  pub fn expire_after(&self) -> Duration {
    Duration::from_secs(self.expire_hours * 3600)
  }
}

impl Default for SessionSettings {
  fn default() -> Self {
    Self {
      max_sessions: 5,
      max_items_per_session: 5,
      max_memory_mb: None,
      expire_hours: 24,
    }
  }
}
