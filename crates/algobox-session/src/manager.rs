use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use algobox_config::SessionSettings;
use lru::LruCache;
use tracing::{debug, info};

use crate::data_cache::{CachedItem, DataCache};
use crate::SessionError;

/// Limits applied by a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLimits {
  pub max_sessions: usize,
  pub max_items_per_session: usize,
  pub max_memory_bytes: Option<u64>,
  pub expire_after: Duration,
}

impl From<&SessionSettings> for SessionLimits {
  fn from(settings: &SessionSettings) -> Self {
    Self {
      max_sessions: settings.max_sessions,
      max_items_per_session: settings.max_items_per_session,
      max_memory_bytes: settings.max_memory_bytes(),
      expire_after: settings.expire_after(),
    }
  }
}

impl Default for SessionLimits {
  fn default() -> Self {
    Self::from(&SessionSettings::default())
  }
}

struct Session {
  cache: DataCache,
  created: Instant,
}

/// Process-wide owner of all live sessions.
///
/// Sessions are created on their first stored item, dropped least recently
/// used beyond `max_sessions`, and purged on the next access once older than
/// `expire_after`.
pub struct SessionManager {
  limits: SessionLimits,
  sessions: Mutex<LruCache<String, Session>>,
}

impl SessionManager {
  pub fn new(limits: SessionLimits) -> Self {
    let max_sessions = NonZeroUsize::new(limits.max_sessions).unwrap_or(NonZeroUsize::MIN);
    Self {
      sessions: Mutex::new(LruCache::new(max_sessions)),
      limits,
    }
  }

  pub fn from_settings(settings: &SessionSettings) -> Self {
    Self::new(SessionLimits::from(settings))
  }

  pub fn limits(&self) -> &SessionLimits {
    &self.limits
  }

  /// Open a handle on a session, generating a token when none is given.
  pub fn open(self: &Arc<Self>, token: Option<String>) -> TaskSession {
    let token = token
      .filter(|t| !t.is_empty())
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    drop(self.lock());
    TaskSession::Active {
      token,
      manager: self.clone(),
    }
  }

  /// Number of live sessions.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains(&self, token: &str) -> bool {
    self.lock().contains(token)
  }

  /// Drop all sessions.
  pub fn shutdown(&self) {
    let mut sessions = self.lock();
    info!(sessions = sessions.len(), "dropping all sessions");
    sessions.clear();
  }

  /// Lock the session map, purging expired sessions first.
  fn lock(&self) -> MutexGuard<'_, LruCache<String, Session>> {
    let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
    let expire_after = self.limits.expire_after;
    let expired: Vec<String> = sessions
      .iter()
      .filter(|(_, s)| s.created.elapsed() > expire_after)
      .map(|(token, _)| token.clone())
      .collect();
    for token in &expired {
      sessions.pop(token);
    }
    if !expired.is_empty() {
      debug!(purged = expired.len(), "purged expired sessions");
    }
    sessions
  }

  fn add_item(&self, token: &str, key: &str, item: CachedItem) {
    let mut sessions = self.lock();
    if !sessions.contains(token) {
      let session = Session {
        cache: DataCache::new(self.limits.max_items_per_session, self.limits.max_memory_bytes),
        created: Instant::now(),
      };
      if let Some((evicted, _)) = sessions.push(token.to_string(), session) {
        info!(session = %evicted, "evicted least recently used session");
      }
    }
    if let Some(session) = sessions.get_mut(token) {
      session.cache.add_item(key, item);
    }
  }

  fn get_item(&self, token: &str, key: &str) -> Result<CachedItem, SessionError> {
    let mut sessions = self.lock();
    let session = sessions
      .get_mut(token)
      .ok_or_else(|| SessionError::NotFound {
        key: key.to_string(),
      })?;
    session.cache.get(key)
  }

  fn remove_item(&self, token: &str, key: &str) {
    if let Some(session) = self.lock().get_mut(token) {
      session.cache.remove_item(key);
    }
  }

  fn clear(&self, token: &str) {
    if let Some(session) = self.lock().get_mut(token) {
      session.cache.clear();
    }
  }
}

/// A task's view of its session.
#[derive(Clone)]
pub enum TaskSession {
  Active {
    token: String,
    manager: Arc<SessionManager>,
  },
  /// The owning backend cannot keep process-local state between requests.
  Unsupported { backend: String },
}

impl TaskSession {
  pub fn unsupported(backend: impl Into<String>) -> Self {
    Self::Unsupported {
      backend: backend.into(),
    }
  }

  /// The session token, absent when sessions are unsupported.
  pub fn token(&self) -> Option<&str> {
    match self {
      Self::Active { token, .. } => Some(token),
      Self::Unsupported { .. } => None,
    }
  }

  pub fn is_supported(&self) -> bool {
    matches!(self, Self::Active { .. })
  }

  fn active(&self) -> Result<(&str, &SessionManager), SessionError> {
    match self {
      Self::Active { token, manager } => Ok((token, manager)),
      Self::Unsupported { backend } => Err(SessionError::Unsupported {
        backend: backend.clone(),
      }),
    }
  }

  pub fn add_item(&self, key: &str, item: CachedItem) -> Result<(), SessionError> {
    let (token, manager) = self.active()?;
    manager.add_item(token, key, item);
    Ok(())
  }

  pub fn get_item(&self, key: &str) -> Result<CachedItem, SessionError> {
    let (token, manager) = self.active()?;
    manager.get_item(token, key).map_err(|e| match e {
      SessionError::NotFound { key } => SessionError::NotFoundInSession {
        key,
        session: token.to_string(),
      },
      other => other,
    })
  }

  /// Get an item as a concrete type.
  pub fn get<T: std::any::Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, SessionError> {
    self
      .get_item(key)?
      .downcast::<T>()
      .ok_or_else(|| SessionError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>(),
      })
  }

  pub fn remove_item(&self, key: &str) -> Result<(), SessionError> {
    let (token, manager) = self.active()?;
    manager.remove_item(token, key);
    Ok(())
  }

  pub fn clear(&self) -> Result<(), SessionError> {
    let (token, manager) = self.active()?;
    manager.clear(token);
    Ok(())
  }
}

impl std::fmt::Debug for TaskSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Active { token, .. } => f.debug_struct("Active").field("token", token).finish(),
      Self::Unsupported { backend } => f
        .debug_struct("Unsupported")
        .field("backend", backend)
        .finish(),
    }
  }
}
