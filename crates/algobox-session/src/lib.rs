//! Algobox Session
//!
//! Opt-in, token-scoped caches that keep expensive intermediate objects alive
//! across several execution requests of the same client. This is separate
//! from per-execution runner state, which is reset on every run.
//!
//! A [`SessionManager`] is created once per process and shared by every task.
//! Each task gets a [`TaskSession`] handle, which is
//! [`TaskSession::Unsupported`] when the backend runs tasks outside the
//! serving process.

mod data_cache;
mod manager;

pub use data_cache::{CachedItem, DataCache};
pub use manager::{SessionLimits, SessionManager, TaskSession};

/// Errors raised by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("key {key} not found in cache")]
  NotFound { key: String },

  #[error("key {key} not found in cache for session {session}")]
  NotFoundInSession { key: String, session: String },

  #[error(
    "key {key} was removed from the cache due to exceeding the maximum cache size, consider increasing the cache size"
  )]
  EvictedForSize { key: String },

  #[error(
    "key {key} was removed from the cache due to exceeding the maximum memory limit, consider increasing the memory limit"
  )]
  EvictedForMemory { key: String },

  #[error("item {key} is not a {expected}")]
  TypeMismatch { key: String, expected: &'static str },

  #[error(
    "sessions are not supported by the '{backend}' backend because session state is process-local; \
     run algorithms that need sessions with the 'in_process' backend (inference.backend.type = \"in_process\")"
  )]
  Unsupported { backend: String },
}

impl SessionError {
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Self::NotFound { .. }
        | Self::NotFoundInSession { .. }
        | Self::EvictedForSize { .. }
        | Self::EvictedForMemory { .. }
    )
  }
}
