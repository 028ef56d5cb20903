use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::{BlobError, BlobStore, validate_key};

/// Filesystem-based blob store.
///
/// Each object is stored at `{base_path}/{collection}/{key}`. Collection
/// directories are created on first write.
pub struct FsBlobStore {
  base_path: PathBuf,
}

impl FsBlobStore {
  /// Create a new filesystem store with the given base path.
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn key_to_path(&self, collection: &str, key: &str) -> Result<PathBuf, BlobError> {
    validate_key(collection)?;
    validate_key(key)?;
    Ok(self.base_path.join(collection).join(key))
  }
}

#[async_trait]
impl BlobStore for FsBlobStore {
  async fn put(&self, collection: &str, key: &str, data: Bytes) -> Result<(), BlobError> {
    let path = self.key_to_path(collection, key)?;

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }

    // Write to a sibling temp file so readers never observe a torn object.
    let tmp_path = path.with_file_name(format!("{}.partial", key));
    let mut file = File::create(&tmp_path).await?;
    file.write_all(&data).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, &path).await?;
    Ok(())
  }

  async fn get(&self, collection: &str, key: &str) -> Result<Bytes, BlobError> {
    let path = self.key_to_path(collection, key)?;
    let data = fs::read(&path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        BlobError::not_found(collection, key)
      } else {
        BlobError::Io(e)
      }
    })?;
    Ok(Bytes::from(data))
  }

  async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, BlobError> {
    let mut found = Vec::with_capacity(keys.len());
    for key in keys {
      let path = self.key_to_path(collection, key)?;
      found.push(fs::try_exists(&path).await?);
    }
    Ok(found)
  }

  async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), BlobError> {
    for key in keys {
      let path = self.key_to_path(collection, key)?;
      match fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(BlobError::Io(e)),
      }
    }
    Ok(())
  }

  async fn list(&self, collection: &str) -> Result<Vec<String>, BlobError> {
    validate_key(collection)?;
    let dir = self.base_path.join(collection);
    let mut keys = Vec::new();

    if !fs::try_exists(&dir).await? {
      return Ok(keys);
    }

    let mut entries = fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
      if !entry.file_type().await?.is_file() {
        continue;
      }
      let name = match entry.file_name().to_str() {
        Some(n) => n.to_string(),
        None => continue,
      };
      if name.ends_with(".partial") {
        continue;
      }
      keys.push(name);
    }

    keys.sort();
    Ok(keys)
  }
}
