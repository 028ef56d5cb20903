//! Shared services of the execution backend.
//!
//! The [`Runtime`] owns everything a task needs beyond its own record: the
//! record store, the algorithm registry, the data store, the module loader,
//! the device probe and the cache of loaded runners. It is created once per
//! process and shared by every [`TaskHandler`](crate::TaskHandler).

use std::sync::Arc;

use algobox_blob::{BlobStore, RetryPolicy, collections};
use algobox_config::{RetrySettings, ServerConfig};
use algobox_registry::{AlgorithmRegistry, BlobAlgorithmRegistry};
use algobox_store::{BlobRecordStore, RecordStore};

use crate::cache::AlgorithmCache;
use crate::data::{DataCodec, JsonCodec};
use crate::device::{DeviceProbe, SystemDeviceProbe};
use crate::loader::ModuleLoader;

/// Configuration for the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
  /// Maximum number of loaded runners kept in memory.
  pub algorithm_cache_size: usize,
  /// Prefix applied to every collection name.
  pub collection_prefix: String,
  /// Retry policy for record writes and uploads.
  pub retry: RetryPolicy,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      algorithm_cache_size: 1,
      collection_prefix: String::new(),
      retry: RetryPolicy::default(),
    }
  }
}

impl From<&ServerConfig> for RuntimeConfig {
  fn from(config: &ServerConfig) -> Self {
    Self {
      algorithm_cache_size: config.inference.algorithm_cache_size,
      collection_prefix: config.storage.collection_prefix.clone(),
      retry: retry_policy(&config.storage.retry),
    }
  }
}

/// Convert configured retry settings to a storage retry policy.
pub fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
  RetryPolicy {
    attempts: settings.attempts,
    base_delay: settings.base_delay(),
    max_delay: settings.max_delay(),
    jitter: settings.jitter(),
  }
}

/// Process-wide services shared by all executions.
pub struct Runtime {
  records: Arc<dyn RecordStore>,
  registry: Arc<dyn AlgorithmRegistry>,
  blobs: Arc<dyn BlobStore>,
  loader: Arc<dyn ModuleLoader>,
  probe: Arc<dyn DeviceProbe>,
  codec: Arc<dyn DataCodec>,
  cache: AlgorithmCache,
  data_collection: String,
}

impl Runtime {
  /// Create a runtime whose records, algorithms and datasets all live in `blobs`.
  pub fn new(blobs: Arc<dyn BlobStore>, loader: Arc<dyn ModuleLoader>, config: RuntimeConfig) -> Self {
    let prefix = &config.collection_prefix;
    let records = BlobRecordStore::with_collection(
      blobs.clone(),
      collections::prefixed(prefix, collections::EXECUTIONS),
    )
    .with_retry_policy(config.retry);
    let registry =
      BlobAlgorithmRegistry::with_prefix(blobs.clone(), prefix).with_retry_policy(config.retry);

    Self {
      records: Arc::new(records),
      registry: Arc::new(registry),
      data_collection: collections::prefixed(prefix, collections::DATA),
      blobs,
      loader,
      probe: Arc::new(SystemDeviceProbe::new()),
      codec: Arc::new(JsonCodec),
      cache: AlgorithmCache::new(config.algorithm_cache_size),
    }
  }

  pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
    self.probe = probe;
    self
  }

  pub fn with_codec(mut self, codec: Arc<dyn DataCodec>) -> Self {
    self.codec = codec;
    self
  }

  pub fn with_records(mut self, records: Arc<dyn RecordStore>) -> Self {
    self.records = records;
    self
  }

  pub fn with_registry(mut self, registry: Arc<dyn AlgorithmRegistry>) -> Self {
    self.registry = registry;
    self
  }

  pub fn records(&self) -> &dyn RecordStore {
    self.records.as_ref()
  }

  pub fn registry(&self) -> &dyn AlgorithmRegistry {
    self.registry.as_ref()
  }

  pub fn blobs(&self) -> &dyn BlobStore {
    self.blobs.as_ref()
  }

  pub fn loader(&self) -> &dyn ModuleLoader {
    self.loader.as_ref()
  }

  pub fn probe(&self) -> &dyn DeviceProbe {
    self.probe.as_ref()
  }

  pub fn codec(&self) -> &dyn DataCodec {
    self.codec.as_ref()
  }

  pub fn cache(&self) -> &AlgorithmCache {
    &self.cache
  }

  /// Name of the dataset collection.
  pub fn data_collection(&self) -> &str {
    &self.data_collection
  }
}
