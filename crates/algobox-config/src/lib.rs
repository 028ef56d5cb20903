//! Algobox Config
//!
//! Serializable configuration for the algorithm-execution backend. Every
//! field has a default, so an empty JSON object is a valid configuration:
//!
//! ```json
//! {
//!   "inference": { "backend": { "type": "in_process" }, "algorithm_cache_size": 2 },
//!   "session": { "max_sessions": 10 },
//!   "storage": { "root": "/var/lib/algobox", "collection_prefix": "dev" }
//! }
//! ```

mod inference;
mod session;
mod storage;

pub use inference::{Backend, InferenceSettings};
pub use session::SessionSettings;
pub use storage::{RetrySettings, StorageSettings};

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid value for '{field}': {message}")]
  Invalid { field: &'static str, message: String },
}

/// Top-level configuration for the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub inference: InferenceSettings,
  pub session: SessionSettings,
  pub storage: StorageSettings,
}

impl ServerConfig {
  /// Parse and validate a JSON configuration document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Load configuration from a JSON file.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::from_json_str(&json)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.inference.worker_number == 0 {
      return Err(ConfigError::Invalid {
        field: "inference.worker_number",
        message: "must be at least 1".to_string(),
      });
    }
    if self.session.max_items_per_session == 0 {
      return Err(ConfigError::Invalid {
        field: "session.max_items_per_session",
        message: "must be at least 1".to_string(),
      });
    }
    if let Backend::Distributed { broker_url } = &self.inference.backend
      && broker_url.is_empty()
    {
      return Err(ConfigError::Invalid {
        field: "inference.backend.broker_url",
        message: "must not be empty".to_string(),
      });
    }
    Ok(())
  }
}
