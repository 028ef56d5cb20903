use serde::{Deserialize, Serialize};

/// Task-execution backend an execution request is dispatched to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backend {
  /// Background tasks on the serving process.
  #[default]
  InProcess,
  /// Queue workers fed through a broker.
  Distributed { broker_url: String },
}

impl Backend {
  /// Session state is process-local, so only the in-process backend can keep it.
  pub fn supports_sessions(&self) -> bool {
    matches!(self, Self::InProcess)
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::InProcess => "in_process",
      Self::Distributed { .. } => "distributed",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
  pub backend: Backend,
  /// Maximum number of executions running at once.
  pub worker_number: usize,
  /// Maximum number of loaded algorithms kept in memory.
  pub algorithm_cache_size: usize,
}

impl Default for InferenceSettings {
  fn default() -> Self {
    Self {
      backend: Backend::default(),
      worker_number: 4,
      algorithm_cache_size: 1,
    }
  }
}
