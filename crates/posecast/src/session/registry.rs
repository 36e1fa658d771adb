use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tracing::info;

use crate::animator::AnimatorKind;
use crate::error::RegistryError;

use super::{Session, SessionOptions};

/// Process-wide index of live sessions.
pub struct SessionRegistry {
  sessions: tokio::sync::Mutex<HashMap<String, Arc<Session>>>,
  opts: SessionOptions,
}

impl SessionRegistry {
  pub fn new(opts: SessionOptions) -> Self {
    Self {
      sessions: tokio::sync::Mutex::new(HashMap::new()),
      opts,
    }
  }

  /// Instantiate and index a session. The caller is responsible for
  /// `start`ing it (and for discarding it via [`Self::remove`] if that
  /// fails).
  pub async fn create(
    &self,
    id: &str,
    kind: AnimatorKind,
    source: PathBuf,
  ) -> Result<Arc<Session>, RegistryError> {
    let mut sessions = self.sessions.lock().await;
    if sessions.contains_key(id) {
      return Err(RegistryError::Conflict(id.to_string()));
    }
    let session = Arc::new(Session::new(id, kind, source, self.opts.clone())?);
    sessions.insert(id.to_string(), Arc::clone(&session));
    info!(event = "session_created", session_id = id, kind = %kind);
    Ok(session)
  }

  pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
    self.sessions.lock().await.get(id).cloned()
  }

  /// Drop the index entry without stopping the session. Used to discard a
  /// session whose `start` failed.
  pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
    self.sessions.lock().await.remove(id)
  }

  /// Stop a session and drop it from the index. Unknown ids fail with
  /// `NotFound`; callers translate that to their 404 equivalent.
  pub async fn delete(&self, id: &str) -> Result<(), RegistryError> {
    let session = self
      .sessions
      .lock()
      .await
      .remove(id)
      .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
    session.stop().await;
    info!(event = "session_deleted", session_id = id);
    Ok(())
  }

  pub async fn ids(&self) -> Vec<String> {
    self.sessions.lock().await.keys().cloned().collect()
  }

  /// Stop every session in parallel. Used on process shutdown.
  pub async fn shutdown(&self) {
    let sessions: Vec<Arc<Session>> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
    if sessions.is_empty() {
      return;
    }
    info!(event = "registry_shutdown", sessions = sessions.len());
    join_all(sessions.iter().map(|session| session.stop())).await;
  }
}
