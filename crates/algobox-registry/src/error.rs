use algobox_blob::BlobError;

/// Errors that can occur during algorithm registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("algorithm with id {0} not found")]
  NotFound(String),

  /// A key for the id exists but its name or version fields do not parse.
  #[error("algorithm key '{key}' cannot be matched")]
  KeyMismatch { key: String },

  #[error("algorithm {algorithm_id} version {major}.{minor} already exists")]
  AlreadyExists {
    algorithm_id: String,
    major: u32,
    minor: u32,
  },

  #[error("module {0} not found")]
  ModuleNotFound(String),

  #[error("asset {0} not found")]
  AssetNotFound(String),

  #[error("invalid algorithm descriptor: {0}")]
  InvalidDescriptor(String),

  #[error("failed to parse descriptor: {0}")]
  Json(#[from] serde_json::Error),

  #[error("storage error: {0}")]
  Blob(#[from] BlobError),
}

impl RegistryError {
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Self::NotFound(_) | Self::KeyMismatch { .. } | Self::ModuleNotFound(_) | Self::AssetNotFound(_)
    )
  }
}
