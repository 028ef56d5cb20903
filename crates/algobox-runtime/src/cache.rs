//! Bounded cache of loaded runners.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::device::Device;
use crate::error::RunnerError;
use crate::runner::LoadedRunner;

/// Identity of a cache entry.
///
/// Everything that changes the loaded object is part of the key: the
/// resolved version, the device and the raw override.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub algorithm_id: String,
  pub major_version: u32,
  pub minor_version: u32,
  pub device: Device,
  pub device_override: Option<String>,
}

type Slot = Arc<OnceCell<Arc<LoadedRunner>>>;

/// LRU of loaded runners with one in-flight load per key.
///
/// Concurrent misses on the same key share the first caller's load. A
/// failed load leaves no entry behind.
pub struct AlgorithmCache {
  slots: Mutex<LruCache<CacheKey, Slot>>,
  loads: AtomicUsize,
}

impl AlgorithmCache {
  /// A capacity of zero is treated as one.
  pub fn new(capacity: usize) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self {
      slots: Mutex::new(LruCache::new(capacity)),
      loads: AtomicUsize::new(0),
    }
  }

  pub async fn get_or_load<F, Fut>(
    &self,
    key: CacheKey,
    load: F,
  ) -> Result<Arc<LoadedRunner>, RunnerError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<LoadedRunner, RunnerError>>,
  {
    let slot = self.slot(&key);
    if let Some(loaded) = slot.get() {
      debug!(algorithm_id = %key.algorithm_id, device = %key.device, "algorithm cache hit");
      return Ok(loaded.clone());
    }

    let result = slot
      .get_or_try_init(|| async move {
        self.loads.fetch_add(1, Ordering::SeqCst);
        load().await.map(Arc::new)
      })
      .await;

    match result {
      Ok(loaded) => Ok(loaded.clone()),
      Err(e) => {
        let mut slots = self.lock();
        let stale = slots
          .peek(&key)
          .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized());
        if stale {
          slots.pop(&key);
        }
        Err(e)
      }
    }
  }

  fn slot(&self, key: &CacheKey) -> Slot {
    let mut slots = self.lock();
    if let Some(slot) = slots.get(key) {
      return slot.clone();
    }
    let slot = Slot::default();
    if let Some((evicted, _)) = slots.push(key.clone(), slot.clone()) {
      info!(
        algorithm_id = %evicted.algorithm_id,
        device = %evicted.device,
        "evicted least recently used algorithm"
      );
    }
    slot
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, Slot>> {
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Number of cached entries, including loads in flight.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, key: &CacheKey) -> bool {
    self.lock().contains(key)
  }

  /// Number of loads started since creation.
  pub fn loads(&self) -> usize {
    self.loads.load(Ordering::SeqCst)
  }

  pub fn clear(&self) {
    self.lock().clear();
  }
}

impl std::fmt::Debug for AlgorithmCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AlgorithmCache")
      .field("len", &self.len())
      .field("loads", &self.loads())
      .finish()
  }
}
