//! Module loading.
//!
//! A published module archive is a small JSON manifest naming the runner
//! entry point it was built from. Runners are ordinary Rust types registered
//! with a [`RunnerFactoryRegistry`], so two algorithms can never collide on
//! internal names.

use std::collections::BTreeMap;
use std::sync::Arc;

use algobox_registry::AlgorithmDescriptor;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RunnerError;
use crate::runner::{DynRunner, Runner};

/// Contents of a module archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
  pub entry_point: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

impl ModuleManifest {
  pub fn new(entry_point: impl Into<String>) -> Self {
    Self {
      entry_point: entry_point.into(),
      version: None,
    }
  }

  pub fn with_version(mut self, version: impl Into<String>) -> Self {
    self.version = Some(version.into());
    self
  }

  pub fn parse(module: &[u8]) -> Result<Self, RunnerError> {
    serde_json::from_slice(module)
      .map_err(|e| RunnerError::validation(format!("invalid module manifest: {}", e)))
  }

  pub fn to_bytes(&self) -> Result<Bytes, RunnerError> {
    Ok(Bytes::from(serde_json::to_vec(self)?))
  }
}

/// Turns module bytes into a runner.
pub trait ModuleLoader: Send + Sync {
  fn load(
    &self,
    descriptor: &AlgorithmDescriptor,
    module: &[u8],
  ) -> Result<Box<dyn DynRunner>, RunnerError>;
}

type Factory = Arc<dyn Fn() -> Box<dyn DynRunner> + Send + Sync>;

/// Loader resolving manifests to registered runner constructors.
#[derive(Clone, Default)]
pub struct RunnerFactoryRegistry {
  factories: BTreeMap<String, Factory>,
}

impl RunnerFactoryRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a runner built with `Default`.
  pub fn register<R: Runner + Default>(&mut self, entry_point: impl Into<String>) -> &mut Self {
    self.register_with(entry_point, R::default)
  }

  /// Register a runner built by a closure.
  pub fn register_with<R, F>(&mut self, entry_point: impl Into<String>, build: F) -> &mut Self
  where
    R: Runner,
    F: Fn() -> R + Send + Sync + 'static,
  {
    self.factories.insert(
      entry_point.into(),
      Arc::new(move || Box::new(build()) as Box<dyn DynRunner>),
    );
    self
  }

  pub fn with<R: Runner + Default>(mut self, entry_point: impl Into<String>) -> Self {
    self.register::<R>(entry_point);
    self
  }

  pub fn entry_points(&self) -> impl Iterator<Item = &str> {
    self.factories.keys().map(String::as_str)
  }
}

impl ModuleLoader for RunnerFactoryRegistry {
  fn load(
    &self,
    descriptor: &AlgorithmDescriptor,
    module: &[u8],
  ) -> Result<Box<dyn DynRunner>, RunnerError> {
    let manifest = ModuleManifest::parse(module)?;
    let factory = self.factories.get(&manifest.entry_point).ok_or_else(|| {
      RunnerError::not_found(format!(
        "runner entry point '{}' of {} is not registered",
        manifest.entry_point,
        descriptor.label()
      ))
    })?;
    debug!(
      entry_point = %manifest.entry_point,
      algorithm = %descriptor.label(),
      "instantiating runner"
    );
    Ok(factory())
  }
}

impl std::fmt::Debug for RunnerFactoryRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RunnerFactoryRegistry")
      .field("entry_points", &self.factories.keys().collect::<Vec<_>>())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::context::RunnerContext;
  use crate::handler::TaskHandler;
  use crate::runner::{Args, RunInput};
  use async_trait::async_trait;

  #[derive(Default)]
  struct Noop;

  #[async_trait]
  impl Runner for Noop {
    type Prepared = ();
    type Inferred = ();

    async fn preprocess(
      &self,
      _ctx: &mut RunnerContext,
      _handler: &TaskHandler,
      _input: &RunInput,
      _args: &Args,
    ) -> Result<(), RunnerError> {
      Ok(())
    }

    async fn inference(
      &self,
      _ctx: &mut RunnerContext,
      _handler: &TaskHandler,
      _data: (),
      _args: &Args,
    ) -> Result<(), RunnerError> {
      Ok(())
    }

    async fn postprocess(
      &self,
      _ctx: &mut RunnerContext,
      _handler: &TaskHandler,
      _data: (),
      _args: &Args,
    ) -> Result<Vec<String>, RunnerError> {
      Ok(vec![])
    }
  }

  fn descriptor() -> AlgorithmDescriptor {
    AlgorithmDescriptor {
      algorithm_id: "foo".into(),
      name: "foo".into(),
      major_version: 1,
      minor_version: 0,
      algorithm_type: "Generic".into(),
      tags: vec![],
      description: String::new(),
      module_reference: String::new(),
      assets: Default::default(),
      default_device: None,
      supported_devices: vec![],
      additional_parameter_schema: vec![],
      published_at: None,
    }
  }

  #[test]
  fn test_manifest_bytes_parse_back() {
    let manifest = ModuleManifest::new("noop").with_version("2");
    let bytes = manifest.to_bytes().unwrap();
    assert_eq!(ModuleManifest::parse(&bytes).unwrap(), manifest);
  }

  #[test]
  fn test_manifest_version_is_optional() {
    let manifest = ModuleManifest::parse(br#"{"entry_point": "noop"}"#).unwrap();
    assert_eq!(manifest.entry_point, "noop");
    assert_eq!(manifest.version, None);
  }

  #[test]
  fn test_load_registered_entry_point() {
    let loader = RunnerFactoryRegistry::new().with::<Noop>("noop");
    let module = ModuleManifest::new("noop").to_bytes().unwrap();
    assert!(loader.load(&descriptor(), &module).is_ok());
    assert_eq!(loader.entry_points().collect::<Vec<_>>(), vec!["noop"]);
  }

  #[test]
  fn test_load_unknown_entry_point() {
    let loader = RunnerFactoryRegistry::new().with::<Noop>("noop");
    let module = ModuleManifest::new("other").to_bytes().unwrap();
    let err = loader.load(&descriptor(), &module).err().unwrap();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("'other'"));
  }

  #[test]
  fn test_load_rejects_garbage() {
    let loader = RunnerFactoryRegistry::new();
    let err = loader.load(&descriptor(), b"\x00\x01").err().unwrap();
    assert!(err.is_validation());
  }
}
