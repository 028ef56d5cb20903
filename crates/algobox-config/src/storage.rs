use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
  /// Base directory of the filesystem blob store.
  pub root: PathBuf,
  /// Prepended to every collection name, e.g. `dev-execution-store`.
  pub collection_prefix: String,
  pub retry: RetrySettings,
}

impl Default for StorageSettings {
  fn default() -> Self {
    Self {
      root: PathBuf::from("./algobox-data"),
      collection_prefix: String::new(),
      retry: RetrySettings::default(),
    }
  }
}

/// Backoff for transient storage failures on record writes and uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub jitter_ms: u64,
}

impl RetrySettings {
  pub fn base_delay(&self) -> Duration {
    Duration::from_millis(self.base_delay_ms)
  }

  pub fn max_delay(&self) -> Duration {
    Duration::from_millis(self.max_delay_ms)
  }

  pub fn jitter(&self) -> Duration {
    Duration::from_millis(self.jitter_ms)
  }
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      attempts: 8,
      base_delay_ms: 100,
      max_delay_ms: 2000,
      jitter_ms: 200,
    }
  }
}
