use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{BlobError, BlobStore, validate_key};

type Collections = HashMap<String, BTreeMap<String, Bytes>>;

/// In-memory blob store.
///
/// Suitable for tests, local debugging and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
  collections: RwLock<Collections>,
}

impl MemoryBlobStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn read(&self) -> std::sync::RwLockReadGuard<'_, Collections> {
    self.collections.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> std::sync::RwLockWriteGuard<'_, Collections> {
    self.collections.write().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
  async fn put(&self, collection: &str, key: &str, data: Bytes) -> Result<(), BlobError> {
    validate_key(key)?;
    self
      .write()
      .entry(collection.to_string())
      .or_default()
      .insert(key.to_string(), data);
    Ok(())
  }

  async fn get(&self, collection: &str, key: &str) -> Result<Bytes, BlobError> {
    self
      .read()
      .get(collection)
      .and_then(|c| c.get(key))
      .cloned()
      .ok_or_else(|| BlobError::not_found(collection, key))
  }

  async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, BlobError> {
    let collections = self.read();
    let objects = collections.get(collection);
    Ok(
      keys
        .iter()
        .map(|k| objects.is_some_and(|c| c.contains_key(k)))
        .collect(),
    )
  }

  async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), BlobError> {
    if let Some(objects) = self.write().get_mut(collection) {
      for key in keys {
        objects.remove(key);
      }
    }
    Ok(())
  }

  async fn list(&self, collection: &str) -> Result<Vec<String>, BlobError> {
    Ok(
      self
        .read()
        .get(collection)
        .map(|c| c.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_in_memory_blob_store() {
    let store = MemoryBlobStore::new();

    assert!(store.get("c", "key").await.unwrap_err().is_not_found());

    store.put("c", "key", Bytes::from_static(b"value")).await.unwrap();
    assert_eq!(&store.get("c", "key").await.unwrap()[..], b"value");

    store.put("c", "key", Bytes::from_static(b"updated")).await.unwrap();
    assert_eq!(&store.get("c", "key").await.unwrap()[..], b"updated");

    store.delete("c", &["key".to_string()]).await.unwrap();
    assert!(store.list("c").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_collections_are_separate() {
    let store = MemoryBlobStore::new();
    store.put("a", "k", Bytes::from_static(b"1")).await.unwrap();

    let keys = vec!["k".to_string()];
    assert_eq!(store.exists("a", &keys).await.unwrap(), vec![true]);
    assert_eq!(store.exists("b", &keys).await.unwrap(), vec![false]);
  }
}
