//! Algobox Store
//!
//! This crate provides the storage trait and implementations for execution
//! records. Records are persisted as JSON objects in the `execution-store`
//! collection of a [`BlobStore`](algobox_blob::BlobStore).
//!
//! The [`RecordStore`] trait defines operations for:
//! - Creating a record when an execution request is accepted
//! - Reading a record for polling clients
//! - Read-modify-write updates of single fields, serialized per execution
//!
//! Field updates are validated by [`ExecutionRecord::apply`]: statuses only
//! move forward, terminal records never change, and a progress value lower
//! than the stored one is ignored.

mod blob;
mod types;

pub use blob::BlobRecordStore;
pub use types::{ExecutionRecord, ExecutionStatus, RecordUpdate, validate_progress};

use algobox_blob::BlobError;
use async_trait::async_trait;

/// Error type for record storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("execution not found: {0}")]
  NotFound(String),

  /// A record with this id already exists.
  #[error("execution already exists: {0}")]
  AlreadyExists(String),

  /// A field value was rejected.
  #[error("{0}")]
  Validation(String),

  /// The record reached a terminal status and can no longer change.
  #[error("execution {execution_id} is {status}, cannot update {field}")]
  Terminal {
    execution_id: String,
    status: ExecutionStatus,
    field: &'static str,
  },

  /// The stored record could not be (de)serialized.
  #[error("invalid record: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The underlying blob store failed.
  #[error("storage error: {0}")]
  Blob(#[from] BlobError),
}

impl StoreError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound(_))
  }

  pub fn is_validation(&self) -> bool {
    matches!(self, Self::Validation(_) | Self::Terminal { .. })
  }
}

/// Storage trait for execution records.
#[async_trait]
pub trait RecordStore: Send + Sync {
  /// Store a new record. Fails if the id is already taken.
  async fn create(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

  /// Get a record by execution id.
  async fn get(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError>;

  /// Overwrite a record unconditionally.
  async fn put(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

  /// Apply a single-field update and return the resulting record.
  ///
  /// Updates to the same execution id never interleave.
  async fn update(
    &self,
    execution_id: &str,
    update: RecordUpdate,
  ) -> Result<ExecutionRecord, StoreError>;

  /// Delete a record. Missing records are ignored.
  async fn delete(&self, execution_id: &str) -> Result<(), StoreError>;

  /// List the ids of all stored records.
  async fn list(&self) -> Result<Vec<String>, StoreError>;
}
