use std::any::Any;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::SessionError;

/// A value stored in a session, with the memory it is accounted for.
#[derive(Clone)]
pub struct CachedItem {
  value: Arc<dyn Any + Send + Sync>,
  size_bytes: u64,
}

impl CachedItem {
  /// Wrap a value, accounting only for its inline size.
  pub fn new<T: Any + Send + Sync>(value: T) -> Self {
    Self {
      size_bytes: std::mem::size_of::<T>() as u64,
      value: Arc::new(value),
    }
  }

  /// Wrap a value with an explicit memory footprint.
  pub fn sized<T: Any + Send + Sync>(value: T, size_bytes: u64) -> Self {
    Self {
      value: Arc::new(value),
      size_bytes,
    }
  }

  pub fn size_bytes(&self) -> u64 {
    self.size_bytes
  }

  /// Downcast to the stored type.
  pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self.value.clone().downcast::<T>().ok()
  }
}

impl std::fmt::Debug for CachedItem {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CachedItem")
      .field("size_bytes", &self.size_bytes)
      .finish_non_exhaustive()
  }
}

/// Bounded, optionally memory-capped LRU of named items.
///
/// Keys evicted by either limit are remembered so a later read can say why
/// the item is gone.
#[derive(Debug)]
pub struct DataCache {
  items: LruCache<String, CachedItem>,
  max_memory_bytes: Option<u64>,
  memory_bytes: u64,
  evicted_for_size: HashSet<String>,
  evicted_for_memory: HashSet<String>,
}

impl DataCache {
  /// A `max_items` of zero is treated as one.
  pub fn new(max_items: usize, max_memory_bytes: Option<u64>) -> Self {
    let max_items = NonZeroUsize::new(max_items).unwrap_or(NonZeroUsize::MIN);
    Self {
      items: LruCache::new(max_items),
      max_memory_bytes,
      memory_bytes: 0,
      evicted_for_size: HashSet::new(),
      evicted_for_memory: HashSet::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.items.contains(key)
  }

  /// Accounted memory of all items.
  pub fn memory_bytes(&self) -> u64 {
    self.memory_bytes
  }

  /// Get an item and mark it most recently used.
  pub fn get(&mut self, key: &str) -> Result<CachedItem, SessionError> {
    if let Some(item) = self.items.get(key) {
      return Ok(item.clone());
    }
    let key = key.to_string();
    if self.evicted_for_size.contains(&key) {
      return Err(SessionError::EvictedForSize { key });
    }
    if self.evicted_for_memory.contains(&key) {
      return Err(SessionError::EvictedForMemory { key });
    }
    Err(SessionError::NotFound { key })
  }

  /// Add or replace an item.
  ///
  /// The item count limit evicts the least recently used item first. Then,
  /// with a memory limit, the oldest items go until the cache fits or only
  /// the new item is left.
  pub fn add_item(&mut self, key: impl Into<String>, item: CachedItem) {
    let key = key.into();
    self.evicted_for_size.remove(&key);
    self.evicted_for_memory.remove(&key);

    if let Some(old) = self.items.pop(&key) {
      self.memory_bytes -= old.size_bytes;
    }
    self.memory_bytes += item.size_bytes;

    // The key is absent now, so anything returned is an eviction.
    if let Some((evicted, old)) = self.items.push(key, item) {
      debug!(key = %evicted, "evicted session item over the size limit");
      self.memory_bytes -= old.size_bytes;
      self.evicted_for_size.insert(evicted);
    }

    if let Some(limit) = self.max_memory_bytes {
      while self.memory_bytes > limit && self.items.len() > 1 {
        let Some((evicted, old)) = self.items.pop_lru() else {
          break;
        };
        debug!(key = %evicted, "evicted session item over the memory limit");
        self.memory_bytes -= old.size_bytes;
        self.evicted_for_memory.insert(evicted);
      }
    }
  }

  /// Remove an item. Missing keys are ignored.
  pub fn remove_item(&mut self, key: &str) {
    if let Some(old) = self.items.pop(key) {
      self.memory_bytes -= old.size_bytes;
    }
  }

  pub fn clear(&mut self) {
    self.items.clear();
    self.memory_bytes = 0;
  }
}
