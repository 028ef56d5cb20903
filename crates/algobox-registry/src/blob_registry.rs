use std::collections::BTreeMap;
use std::sync::Arc;

use algobox_blob::{BlobStore, RetryPolicy, collections, with_retry};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{info, instrument};

use crate::descriptor::AlgorithmDescriptor;
use crate::error::RegistryError;
use crate::key::AlgorithmKey;
use crate::registry::{AlgorithmPackage, AlgorithmRegistry};

/// Algorithm registry backed by blob collections.
///
/// ```text
/// algorithm-store/{id}~{name}~{major}~{minor}   descriptor JSON
/// module-store/{module_id}                      module archive
/// asset-store/{asset_id}                        asset bytes
/// ```
pub struct BlobAlgorithmRegistry {
  blobs: Arc<dyn BlobStore>,
  algorithms: String,
  modules: String,
  assets: String,
  retry: RetryPolicy,
}

impl BlobAlgorithmRegistry {
  pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
    Self::with_prefix(blobs, "")
  }

  /// Use collections named `{prefix}-algorithm-store` etc.
  pub fn with_prefix(blobs: Arc<dyn BlobStore>, prefix: &str) -> Self {
    Self {
      blobs,
      algorithms: collections::prefixed(prefix, collections::ALGORITHMS),
      modules: collections::prefixed(prefix, collections::MODULES),
      assets: collections::prefixed(prefix, collections::ASSETS),
      retry: RetryPolicy::default(),
    }
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Find the newest key published for `algorithm_id`.
  async fn find_key(&self, algorithm_id: &str) -> Result<AlgorithmKey, RegistryError> {
    let mut newest: Option<AlgorithmKey> = None;
    for raw in self.blobs.list(&self.algorithms).await? {
      if AlgorithmKey::id_of(&raw) != algorithm_id {
        continue;
      }
      let key = AlgorithmKey::parse(&raw).ok_or(RegistryError::KeyMismatch { key: raw.clone() })?;
      if newest.as_ref().is_none_or(|n| key.version() > n.version()) {
        newest = Some(key);
      }
    }
    newest.ok_or_else(|| RegistryError::NotFound(algorithm_id.to_string()))
  }

  async fn upload(&self, collection: &str, data: Bytes) -> Result<String, RegistryError> {
    let id = uuid::Uuid::new_v4().to_string();
    with_retry(&self.retry, "upload", || {
      self.blobs.put(collection, &id, data.clone())
    })
    .await?;
    Ok(id)
  }
}

#[async_trait]
impl AlgorithmRegistry for BlobAlgorithmRegistry {
  async fn get(&self, algorithm_id: &str) -> Result<AlgorithmDescriptor, RegistryError> {
    let key = self.find_key(algorithm_id).await?;
    let data = self
      .blobs
      .get(&self.algorithms, &key.to_string())
      .await
      .map_err(|e| {
        if e.is_not_found() {
          RegistryError::NotFound(algorithm_id.to_string())
        } else {
          RegistryError::Blob(e)
        }
      })?;
    let descriptor: AlgorithmDescriptor = serde_json::from_slice(&data)?;
    descriptor.validate()?;
    Ok(descriptor)
  }

  async fn list(&self) -> Result<Vec<AlgorithmDescriptor>, RegistryError> {
    let mut descriptors = Vec::new();
    for raw in self.blobs.list(&self.algorithms).await? {
      if AlgorithmKey::parse(&raw).is_none() {
        continue;
      }
      let data = self.blobs.get(&self.algorithms, &raw).await?;
      descriptors.push(serde_json::from_slice(&data)?);
    }
    Ok(descriptors)
  }

  async fn fetch_module(&self, module_reference: &str) -> Result<Bytes, RegistryError> {
    self
      .blobs
      .get(&self.modules, module_reference)
      .await
      .map_err(|e| {
        if e.is_not_found() {
          RegistryError::ModuleNotFound(module_reference.to_string())
        } else {
          RegistryError::Blob(e)
        }
      })
  }

  async fn fetch_asset(&self, locator: &str) -> Result<Bytes, RegistryError> {
    self.blobs.get(&self.assets, locator).await.map_err(|e| {
      if e.is_not_found() {
        RegistryError::AssetNotFound(locator.to_string())
      } else {
        RegistryError::Blob(e)
      }
    })
  }

  #[instrument(
    name = "algorithm_publish",
    skip(self, package),
    fields(algorithm_id = %package.algorithm_id)
  )]
  async fn publish(&self, package: AlgorithmPackage) -> Result<AlgorithmDescriptor, RegistryError> {
    let mut descriptor = AlgorithmDescriptor {
      algorithm_id: package.algorithm_id,
      name: package.name,
      major_version: package.major_version,
      minor_version: package.minor_version,
      algorithm_type: package.algorithm_type,
      tags: package.tags,
      description: package.description,
      module_reference: String::new(),
      assets: BTreeMap::new(),
      default_device: package.default_device,
      supported_devices: package.supported_devices,
      additional_parameter_schema: package.additional_parameter_schema,
      published_at: Some(Utc::now()),
    };
    descriptor.validate()?;

    let key = descriptor.key().to_string();
    let exists = self
      .blobs
      .exists(&self.algorithms, std::slice::from_ref(&key))
      .await?;
    if exists.first().copied().unwrap_or(false) {
      return Err(RegistryError::AlreadyExists {
        algorithm_id: descriptor.algorithm_id,
        major: descriptor.major_version,
        minor: descriptor.minor_version,
      });
    }

    descriptor.module_reference = self.upload(&self.modules, package.module).await?;
    info!(module_id = %descriptor.module_reference, "stored algorithm module");

    for (path, data) in package.assets {
      let asset_id = self.upload(&self.assets, data).await?;
      info!(asset = %path, asset_id = %asset_id, "stored algorithm asset");
      descriptor.assets.insert(path, asset_id);
    }

    let json = Bytes::from(serde_json::to_vec_pretty(&descriptor)?);
    with_retry(&self.retry, "put_algorithm_descriptor", || {
      self.blobs.put(&self.algorithms, &key, json.clone())
    })
    .await?;
    info!(key = %key, "published algorithm");

    Ok(descriptor)
  }

  async fn remove(&self, algorithm_id: &str) -> Result<(), RegistryError> {
    let keys: Vec<String> = self
      .blobs
      .list(&self.algorithms)
      .await?
      .into_iter()
      .filter(|k| AlgorithmKey::id_of(k) == algorithm_id)
      .collect();
    if keys.is_empty() {
      return Err(RegistryError::NotFound(algorithm_id.to_string()));
    }
    self.blobs.delete(&self.algorithms, &keys).await?;
    Ok(())
  }
}
