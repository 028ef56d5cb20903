use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::descriptor::{AlgorithmDescriptor, DeviceKind};
use crate::error::RegistryError;

/// Everything needed to publish one algorithm version.
#[derive(Debug, Clone)]
pub struct AlgorithmPackage {
  pub algorithm_id: String,
  pub name: String,
  pub major_version: u32,
  pub minor_version: u32,
  pub algorithm_type: String,
  pub tags: Vec<String>,
  pub description: String,
  pub default_device: Option<DeviceKind>,
  pub supported_devices: Vec<DeviceKind>,
  pub additional_parameter_schema: Vec<serde_json::Value>,
  /// Module archive bytes.
  pub module: Bytes,
  /// Relative asset path to asset bytes.
  pub assets: BTreeMap<String, Bytes>,
}

impl AlgorithmPackage {
  pub fn new(
    algorithm_id: impl Into<String>,
    name: impl Into<String>,
    major_version: u32,
    minor_version: u32,
    module: Bytes,
  ) -> Self {
    Self {
      algorithm_id: algorithm_id.into(),
      name: name.into(),
      major_version,
      minor_version,
      algorithm_type: "Generic".to_string(),
      tags: Vec::new(),
      description: String::new(),
      default_device: Some(DeviceKind::Cpu),
      supported_devices: vec![DeviceKind::Cpu],
      additional_parameter_schema: Vec::new(),
      module,
      assets: BTreeMap::new(),
    }
  }

  pub fn with_devices(mut self, default_device: Option<DeviceKind>, supported: Vec<DeviceKind>) -> Self {
    self.default_device = default_device;
    self.supported_devices = supported;
    self
  }

  pub fn with_asset(mut self, path: impl Into<String>, data: Bytes) -> Self {
    self.assets.insert(path.into(), data);
    self
  }
}

/// Resolves algorithm ids to descriptors and serves their code and assets.
#[async_trait]
pub trait AlgorithmRegistry: Send + Sync {
  /// Resolve the newest published version of an algorithm.
  async fn get(&self, algorithm_id: &str) -> Result<AlgorithmDescriptor, RegistryError>;

  /// List all published descriptors.
  async fn list(&self) -> Result<Vec<AlgorithmDescriptor>, RegistryError>;

  /// Download a module archive.
  async fn fetch_module(&self, module_reference: &str) -> Result<Bytes, RegistryError>;

  /// Download an asset by its locator.
  async fn fetch_asset(&self, locator: &str) -> Result<Bytes, RegistryError>;

  /// Upload a package's module and assets, then write its descriptor.
  async fn publish(&self, package: AlgorithmPackage) -> Result<AlgorithmDescriptor, RegistryError>;

  /// Remove every version of an algorithm. Module and asset objects are left in place.
  async fn remove(&self, algorithm_id: &str) -> Result<(), RegistryError>;
}
