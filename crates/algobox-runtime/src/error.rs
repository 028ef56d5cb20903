//! Runner error types.

use std::any::Any;

use algobox_blob::BlobError;
use algobox_registry::RegistryError;
use algobox_session::SessionError;
use algobox_store::StoreError;

/// Errors raised while fetching, initializing or running an algorithm.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
  /// A value was rejected (progress, status, data schema, device policy).
  #[error("{0}")]
  Validation(String),

  /// An algorithm, asset, dataset or record does not exist.
  #[error("{0}")]
  NotFound(String),

  /// Task code tried to reassign a frozen asset attribute.
  #[error("Attribute '{name}' is locked and cannot be modified.")]
  AttributeLocked { name: String },

  /// Task code tried to write one of the names owned by the runtime.
  #[error("Attribute '{name}' is reserved by the runtime and cannot be set.")]
  ReservedAttribute { name: String },

  #[error("attribute '{name}' is not set")]
  MissingAttribute { name: String },

  #[error("attribute '{name}' is not a {expected}")]
  AttributeType { name: String, expected: &'static str },

  /// Session operations are not available under the current backend.
  #[error("{0}")]
  SessionUnsupported(#[source] SessionError),

  /// Any other session failure (missing or evicted item).
  #[error("session error: {0}")]
  Session(#[source] SessionError),

  #[error("storage error: {0}")]
  Storage(#[from] BlobError),

  #[error("record store error: {0}")]
  Store(#[source] StoreError),

  /// The registry failed for reasons other than a missing or invalid
  /// algorithm, such as an unreadable stored descriptor.
  #[error("registry error: {0}")]
  Registry(#[source] RegistryError),

  #[error("Failed to fetch algorithm: {source}")]
  FetchAlgorithm {
    #[source]
    source: Box<RunnerError>,
  },

  /// A pipeline stage failed.
  #[error("{message}")]
  Stage { message: String },

  #[error("invalid data: {0}")]
  Codec(#[from] serde_json::Error),
}

impl RunnerError {
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation(message.into())
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self::NotFound(message.into())
  }

  /// Failure raised by user stage code.
  pub fn stage(message: impl Into<String>) -> Self {
    Self::Stage {
      message: message.into(),
    }
  }

  /// Turn the payload of a panicking stage into a stage failure.
  pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    let message = match payload.downcast::<String>() {
      Ok(message) => *message,
      Err(payload) => match payload.downcast::<&'static str>() {
        Ok(message) => message.to_string(),
        Err(_) => "unknown panic payload".to_string(),
      },
    };
    Self::stage(format!("stage panicked: {}", message))
  }

  pub fn fetch_algorithm(source: RunnerError) -> Self {
    Self::FetchAlgorithm {
      source: Box::new(source),
    }
  }

  /// Whether an outer layer should report this as a missing resource.
  pub fn is_not_found(&self) -> bool {
    match self {
      Self::NotFound(_) => true,
      Self::Session(e) => e.is_not_found(),
      Self::Store(e) => e.is_not_found(),
      Self::Storage(e) => e.is_not_found(),
      Self::FetchAlgorithm { source } => source.is_not_found(),
      _ => false,
    }
  }

  pub fn is_validation(&self) -> bool {
    match self {
      Self::Validation(_) => true,
      Self::Store(e) => e.is_validation(),
      _ => false,
    }
  }
}

impl From<StoreError> for RunnerError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::Validation(message) => Self::Validation(message),
      other => Self::Store(other),
    }
  }
}

impl From<RegistryError> for RunnerError {
  fn from(e: RegistryError) -> Self {
    match e {
      RegistryError::Blob(e) => Self::Storage(e),
      RegistryError::InvalidDescriptor(message) => Self::Validation(message),
      e if e.is_not_found() => Self::NotFound(e.to_string()),
      e => Self::Registry(e),
    }
  }
}

impl From<SessionError> for RunnerError {
  fn from(e: SessionError) -> Self {
    match e {
      SessionError::Unsupported { .. } => Self::SessionUnsupported(e),
      other => Self::Session(other),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_not_found_classification() {
    let err: RunnerError = RegistryError::NotFound("foo".into()).into();
    assert!(err.is_not_found());
    assert!(RunnerError::fetch_algorithm(err).is_not_found());

    let err: RunnerError = SessionError::EvictedForSize { key: "k".into() }.into();
    assert!(err.is_not_found());

    assert!(!RunnerError::stage("bad input").is_not_found());
  }

  #[test]
  fn test_store_validation_maps_to_validation() {
    let err: RunnerError = StoreError::Validation("progress must be".into()).into();
    assert!(matches!(err, RunnerError::Validation(_)));
    assert!(err.is_validation());
  }

  #[test]
  fn test_corrupt_descriptor_is_not_validation() {
    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: RunnerError = RegistryError::Json(json).into();
    assert!(matches!(err, RunnerError::Registry(_)));
    assert!(!err.is_validation());
    assert!(!err.is_not_found());

    let err: RunnerError = RegistryError::InvalidDescriptor("no module".into()).into();
    assert!(err.is_validation());
  }

  #[test]
  fn test_panic_payload_becomes_stage_error() {
    let err = RunnerError::from_panic(Box::new("index out of bounds"));
    assert!(matches!(err, RunnerError::Stage { .. }));
    assert_eq!(err.to_string(), "stage panicked: index out of bounds");

    let err = RunnerError::from_panic(Box::new(format!("bad {}", 3)));
    assert_eq!(err.to_string(), "stage panicked: bad 3");

    let err = RunnerError::from_panic(Box::new(42u8));
    assert_eq!(err.to_string(), "stage panicked: unknown panic payload");
  }

  #[test]
  fn test_session_unsupported_is_distinct() {
    let err: RunnerError = SessionError::Unsupported {
      backend: "distributed".into(),
    }
    .into();
    assert!(matches!(err, RunnerError::SessionUnsupported(_)));
    assert!(err.to_string().contains("in_process"));
  }

  #[test]
  fn test_messages() {
    let err = RunnerError::fetch_algorithm(RunnerError::not_found("Algorithm with id foo not found."));
    assert_eq!(
      err.to_string(),
      "Failed to fetch algorithm: Algorithm with id foo not found."
    );
    let err = RunnerError::AttributeLocked {
      name: "weights".into(),
    };
    assert_eq!(
      err.to_string(),
      "Attribute 'weights' is locked and cannot be modified."
    );
  }
}
