//! Per-execution attribute scope of a runner.
//!
//! A loaded runner is shared by every execution that fetches it, so the
//! runner itself stays immutable. What an algorithm would keep as instance
//! state lives in a [`RunnerContext`], one per logical execution:
//!
//! - context attributes, written freely and dropped when the execution ends
//! - asset attributes, written once while the runner loads its assets and
//!   frozen into an [`AssetSet`] shared by every later execution
//!
//! Reassigning an asset name fails with [`RunnerError::AttributeLocked`].
//! Mutating an asset through interior mutability (a `Mutex<Vec<_>>`, say) is
//! not intercepted, and the change is visible to every execution sharing the
//! runner.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::device::Device;
use crate::error::RunnerError;

/// A stored attribute value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Names owned by the runtime. Task code can read them through dedicated
/// accessors but never write them.
pub const RESERVED_NAMES: [&str; 3] = ["device", "task_handler", "runner_context"];

/// Frozen asset attributes of one loaded runner.
#[derive(Default)]
pub struct AssetSet {
  values: HashMap<String, Value>,
}

impl AssetSet {
  pub fn empty() -> Self {
    Self::default()
  }

  /// The locked attribute names.
  pub fn names(&self) -> BTreeSet<&str> {
    self.values.keys().map(String::as_str).collect()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.values.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  fn get(&self, name: &str) -> Option<&Value> {
    self.values.get(name)
  }
}

impl std::fmt::Debug for AssetSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AssetSet")
      .field("names", &self.names())
      .finish()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Running the runner's `init`. Writes to locked names are ignored.
  Initializing,
  /// Running `load_assets`. Every write becomes a locked asset.
  LoadingAssets,
  /// Pipeline stages. Writes to locked names fail.
  Running,
}

/// Attribute scope of one logical execution.
pub struct RunnerContext {
  device: Device,
  phase: Phase,
  scope: HashMap<String, Value>,
  loading: HashMap<String, Value>,
  assets: Arc<AssetSet>,
}

impl RunnerContext {
  /// A fresh, empty scope over already frozen assets.
  pub fn new(device: Device, assets: Arc<AssetSet>) -> Self {
    Self {
      device,
      phase: Phase::Initializing,
      scope: HashMap::new(),
      loading: HashMap::new(),
      assets,
    }
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub(crate) fn set_phase(&mut self, phase: Phase) {
    self.phase = phase;
  }

  /// Freeze everything written during the asset loading phase.
  pub(crate) fn freeze_assets(&mut self) -> Arc<AssetSet> {
    let values = std::mem::take(&mut self.loading);
    self.assets = Arc::new(AssetSet { values });
    self.phase = Phase::Running;
    self.assets.clone()
  }

  pub fn is_locked(&self, name: &str) -> bool {
    self.assets.contains(name) || self.loading.contains_key(name)
  }

  /// Set an attribute.
  pub fn set<T: Any + Send + Sync>(&mut self, name: &str, value: T) -> Result<(), RunnerError> {
    self.set_value(name, Arc::new(value))
  }

  /// Set an attribute to an already shared value.
  pub fn set_value(&mut self, name: &str, value: Value) -> Result<(), RunnerError> {
    if RESERVED_NAMES.contains(&name) {
      return Err(RunnerError::ReservedAttribute {
        name: name.to_string(),
      });
    }

    if self.phase == Phase::LoadingAssets {
      self.loading.insert(name.to_string(), value);
      return Ok(());
    }

    if self.assets.contains(name) {
      if self.phase == Phase::Initializing {
        debug!(name, "ignoring write to locked attribute while initializing");
        return Ok(());
      }
      return Err(RunnerError::AttributeLocked {
        name: name.to_string(),
      });
    }

    self.scope.insert(name.to_string(), value);
    Ok(())
  }

  /// Read an attribute: the execution scope first, then the assets.
  pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
    self.value(name)?.clone().downcast::<T>().ok()
  }

  pub fn value(&self, name: &str) -> Option<&Value> {
    self
      .scope
      .get(name)
      .or_else(|| self.loading.get(name))
      .or_else(|| self.assets.get(name))
  }

  /// Read an attribute that must be present with the given type.
  pub fn require<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, RunnerError> {
    let value = self.value(name).ok_or_else(|| RunnerError::MissingAttribute {
      name: name.to_string(),
    })?;
    value
      .clone()
      .downcast::<T>()
      .map_err(|_| RunnerError::AttributeType {
        name: name.to_string(),
        expected: std::any::type_name::<T>(),
      })
  }

  pub fn contains(&self, name: &str) -> bool {
    self.value(name).is_some()
  }

  /// Remove a context attribute. Locked assets cannot be removed.
  pub fn remove(&mut self, name: &str) -> Result<Option<Value>, RunnerError> {
    if self.is_locked(name) && self.phase != Phase::LoadingAssets {
      return Err(RunnerError::AttributeLocked {
        name: name.to_string(),
      });
    }
    Ok(self.scope.remove(name).or_else(|| self.loading.remove(name)))
  }
}

impl std::fmt::Debug for RunnerContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RunnerContext")
      .field("device", &self.device)
      .field("phase", &self.phase)
      .field("scope", &self.scope.keys().collect::<BTreeSet<_>>())
      .field("assets", &self.assets)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  fn loaded_context() -> RunnerContext {
    let mut ctx = RunnerContext::new(Device::Cpu, Arc::new(AssetSet::empty()));
    ctx.set_phase(Phase::LoadingAssets);
    ctx.set("weights", Mutex::new(vec![1, 2, 3])).unwrap();
    ctx.set("threshold", 0.5f64).unwrap();
    let assets = ctx.freeze_assets();
    RunnerContext::new(Device::Cpu, assets)
  }

  #[test]
  fn test_assets_are_locked_after_loading() {
    let mut ctx = loaded_context();
    ctx.set_phase(Phase::Running);

    let err = ctx.set("weights", Mutex::new(vec![99])).unwrap_err();
    assert!(matches!(err, RunnerError::AttributeLocked { ref name } if name == "weights"));
    assert!(ctx.remove("threshold").is_err());
    assert_eq!(*ctx.require::<f64>("threshold").unwrap(), 0.5);
  }

  #[test]
  fn test_in_place_mutation_is_allowed() {
    let mut ctx = loaded_context();
    ctx.set_phase(Phase::Running);

    ctx
      .require::<Mutex<Vec<i32>>>("weights")
      .unwrap()
      .lock()
      .unwrap()
      .push(4);
    let weights = ctx.require::<Mutex<Vec<i32>>>("weights").unwrap();
    assert_eq!(*weights.lock().unwrap(), vec![1, 2, 3, 4]);
  }

  #[test]
  fn test_locked_writes_ignored_while_initializing() {
    let mut ctx = loaded_context();
    assert_eq!(ctx.phase(), Phase::Initializing);
    ctx.set("threshold", 0.9f64).unwrap();
    assert_eq!(*ctx.require::<f64>("threshold").unwrap(), 0.5);
  }

  #[test]
  fn test_context_attributes() {
    let mut ctx = loaded_context();
    ctx.set_phase(Phase::Running);
    ctx.set("counter", 1u32).unwrap();
    ctx.set("counter", 2u32).unwrap();
    assert_eq!(*ctx.require::<u32>("counter").unwrap(), 2);
    assert!(ctx.get::<String>("counter").is_none());
    assert!(matches!(
      ctx.require::<String>("counter").unwrap_err(),
      RunnerError::AttributeType { .. }
    ));
    assert!(ctx.remove("counter").unwrap().is_some());
    assert!(matches!(
      ctx.require::<u32>("counter").unwrap_err(),
      RunnerError::MissingAttribute { .. }
    ));
  }

  #[test]
  fn test_reserved_names() {
    let mut ctx = RunnerContext::new(Device::Cuda, Arc::new(AssetSet::empty()));
    for name in RESERVED_NAMES {
      assert!(matches!(
        ctx.set(name, 1u8).unwrap_err(),
        RunnerError::ReservedAttribute { .. }
      ));
    }
    assert_eq!(ctx.device(), Device::Cuda);
  }

  #[test]
  fn test_scopes_are_independent() {
    let assets = loaded_context().assets.clone();
    let mut a = RunnerContext::new(Device::Cpu, assets.clone());
    let mut b = RunnerContext::new(Device::Cpu, assets);
    a.set("counter", "a".to_string()).unwrap();
    b.set("counter", "b".to_string()).unwrap();
    assert_eq!(*a.require::<String>("counter").unwrap(), "a");
    assert_eq!(*b.require::<String>("counter").unwrap(), "b");
  }
}
