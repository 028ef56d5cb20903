use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use algobox_blob::{BlobStore, RetryPolicy, collections, with_retry};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::{ExecutionRecord, RecordStore, RecordUpdate, StoreError};

type KeyLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Execution records stored as JSON objects in a blob collection.
///
/// Writes are retried on transient storage errors. Reads fail fast.
pub struct BlobRecordStore {
  blobs: Arc<dyn BlobStore>,
  collection: String,
  retry: RetryPolicy,
  locks: KeyLocks,
}

impl BlobRecordStore {
  /// Create a store over the default `execution-store` collection.
  pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
    Self::with_collection(blobs, collections::EXECUTIONS)
  }

  pub fn with_collection(blobs: Arc<dyn BlobStore>, collection: impl Into<String>) -> Self {
    Self {
      blobs,
      collection: collection.into(),
      retry: RetryPolicy::default(),
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  fn lock_for(&self, execution_id: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    locks
      .entry(execution_id.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }

  /// Drop the per-id lock once nobody else holds or waits on it.
  fn release(&self, execution_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
    // One reference in the map, one held here.
    if Arc::strong_count(&lock) == 2 {
      locks.remove(execution_id);
    }
    drop(lock);
  }

  async fn write(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
    let data = Bytes::from(serde_json::to_vec_pretty(record)?);
    with_retry(&self.retry, "put_execution_record", || {
      self
        .blobs
        .put(&self.collection, &record.execution_id, data.clone())
    })
    .await?;
    Ok(())
  }

  async fn read(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
    let data = self
      .blobs
      .get(&self.collection, execution_id)
      .await
      .map_err(|e| {
        if e.is_not_found() {
          StoreError::NotFound(execution_id.to_string())
        } else {
          StoreError::Blob(e)
        }
      })?;
    Ok(serde_json::from_slice(&data)?)
  }
}

#[async_trait]
impl RecordStore for BlobRecordStore {
  async fn create(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
    let lock = self.lock_for(&record.execution_id);
    let result: Result<(), StoreError> = async {
      let _guard = lock.lock().await;
      let existing = self
        .blobs
        .exists(&self.collection, std::slice::from_ref(&record.execution_id))
        .await?;
      if existing.first().copied().unwrap_or(false) {
        return Err(StoreError::AlreadyExists(record.execution_id.clone()));
      }
      self.write(record).await
    }
    .await;
    self.release(&record.execution_id, lock);
    result
  }

  async fn get(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
    self.read(execution_id).await
  }

  async fn put(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
    let lock = self.lock_for(&record.execution_id);
    let result = {
      let _guard = lock.lock().await;
      self.write(record).await
    };
    self.release(&record.execution_id, lock);
    result
  }

  async fn update(
    &self,
    execution_id: &str,
    update: RecordUpdate,
  ) -> Result<ExecutionRecord, StoreError> {
    let lock = self.lock_for(execution_id);
    let result = async {
      let _guard = lock.lock().await;
      let mut record = self.read(execution_id).await?;
      if record.apply(&update)? {
        debug!(execution_id = %execution_id, field = update.field(), "record updated");
        self.write(&record).await?;
      }
      Ok::<_, StoreError>(record)
    }
    .await;
    self.release(execution_id, lock);
    result
  }

  async fn delete(&self, execution_id: &str) -> Result<(), StoreError> {
    self
      .blobs
      .delete(&self.collection, &[execution_id.to_string()])
      .await?;
    Ok(())
  }

  async fn list(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.blobs.list(&self.collection).await?)
  }
}
