//! Algobox Blob
//!
//! This crate provides the blob storage trait and implementations for algobox.
//! Blobs are opaque byte objects grouped into named collections (buckets in an
//! S3-compatible store, directories on a filesystem).
//!
//! Every durable piece of state in the backend lives in a collection:
//! - execution records (JSON) in [`collections::EXECUTIONS`]
//! - algorithm descriptors in [`collections::ALGORITHMS`]
//! - module archives in [`collections::MODULES`]
//! - binary assets in [`collections::ASSETS`]
//! - input and output datasets in [`collections::DATA`]
//!
//! Backends report failures through [`BlobError`], which classifies errors as
//! transient or permanent. Only transient errors are eligible for the bounded
//! retry in [`retry`].

mod fs;
mod memory;
pub mod retry;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use retry::{RetryPolicy, with_retry};

use async_trait::async_trait;
use bytes::Bytes;

/// Well-known collection names.
pub mod collections {
  pub const EXECUTIONS: &str = "execution-store";
  pub const ALGORITHMS: &str = "algorithm-store";
  pub const MODULES: &str = "module-store";
  pub const ASSETS: &str = "asset-store";
  pub const DATA: &str = "data-store";

  /// All collections the backend expects to exist.
  pub const ALL: [&str; 5] = [EXECUTIONS, ALGORITHMS, MODULES, ASSETS, DATA];

  /// Apply a deployment prefix to a collection name.
  pub fn prefixed(prefix: &str, collection: &str) -> String {
    if prefix.is_empty() {
      collection.to_string()
    } else {
      format!("{}-{}", prefix, collection)
    }
  }
}

/// Error type for blob storage operations.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
  /// The requested object was not found.
  #[error("object not found: {collection}/{key}")]
  NotFound { collection: String, key: String },

  /// The key cannot be used as an object name.
  #[error("invalid object key: {0}")]
  InvalidKey(String),

  /// A failure the backend considers temporary (throttling, contention, unavailability).
  #[error("transient storage error: {message}")]
  Transient { message: String },

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl BlobError {
  pub fn not_found(collection: &str, key: &str) -> Self {
    Self::NotFound {
      collection: collection.to_string(),
      key: key.to_string(),
    }
  }

  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient {
      message: message.into(),
    }
  }

  /// Whether a retry of the same operation may succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Transient { .. } => true,
      Self::Io(e) => matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted
          | std::io::ErrorKind::TimedOut
          | std::io::ErrorKind::WouldBlock
          | std::io::ErrorKind::PermissionDenied
      ),
      _ => false,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound { .. })
  }
}

/// Blob storage trait.
///
/// Implementations provide the actual storage backend (memory, filesystem, S3, etc.).
#[async_trait]
pub trait BlobStore: Send + Sync {
  /// Store an object, overwriting any existing object with the same key.
  async fn put(&self, collection: &str, key: &str, data: Bytes) -> Result<(), BlobError>;

  /// Retrieve an object.
  async fn get(&self, collection: &str, key: &str) -> Result<Bytes, BlobError>;

  /// Check which of the given keys exist, in order.
  async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, BlobError>;

  /// Delete objects. Missing keys are ignored.
  async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), BlobError>;

  /// List all keys in a collection, sorted.
  async fn list(&self, collection: &str) -> Result<Vec<String>, BlobError>;
}

/// Reject keys that would escape a collection.
pub(crate) fn validate_key(key: &str) -> Result<(), BlobError> {
  if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
    return Err(BlobError::InvalidKey(key.to_string()));
  }
  Ok(())
}
