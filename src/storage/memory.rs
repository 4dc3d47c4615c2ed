use super::{
  Session, SessionCounts, SessionKey, SessionTemplate, Storage, WriteMode, WriteOutcome,
};
use crate::error::StorageError;

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
  templates: BTreeMap<i64, SessionTemplate>,
  sessions: HashMap<SessionKey, Session>,
  closed: bool,
}

/// In-process storage keyed by [`SessionKey`].
///
/// Used by tests and by the server's `--in-memory` mode. The map key is the
/// idempotency key itself, so duplicates are impossible by construction.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_templates(templates: impl IntoIterator<Item = SessionTemplate>) -> Self {
    let storage = Self::new();
    {
      let mut state = storage.state.lock();
      for template in templates {
        state.templates.insert(template.id, template);
      }
    }
    storage
  }

  /// All stored sessions ordered by key.
  pub fn sessions(&self) -> Vec<Session> {
    let state = self.state.lock();
    let mut sessions: Vec<Session> = state.sessions.values().cloned().collect();
    sessions.sort_by_key(|s| s.key);
    sessions
  }

  pub fn session_count(&self) -> usize {
    self.state.lock().sessions.len()
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().closed
  }

  /// Inserts a session directly, bypassing `write_session` bookkeeping.
  pub fn seed_session(&self, session: Session) {
    self.state.lock().sessions.insert(session.key, session);
  }
}

/// Returns an error if the storage has been disconnected.
fn ensure_open(state: &MemoryState) -> Result<(), StorageError> {
  if state.closed {
    Err(StorageError::Closed)
  } else {
    Ok(())
  }
}

#[async_trait]
impl Storage for MemoryStorage {
  async fn active_templates(&self) -> Result<Vec<SessionTemplate>, StorageError> {
    let state = self.state.lock();
    ensure_open(&state)?;
    Ok(state.templates.values().filter(|t| t.active).cloned().collect())
  }

  async fn upsert_template(&self, template: &SessionTemplate) -> Result<(), StorageError> {
    let mut state = self.state.lock();
    ensure_open(&state)?;
    state.templates.insert(template.id, template.clone());
    Ok(())
  }

  async fn existing_keys(&self, keys: &[SessionKey]) -> Result<HashSet<SessionKey>, StorageError> {
    let state = self.state.lock();
    ensure_open(&state)?;
    Ok(
      keys
        .iter()
        .filter(|key| state.sessions.contains_key(key))
        .copied()
        .collect(),
    )
  }

  async fn write_session(
    &self,
    session: &Session,
    mode: WriteMode,
  ) -> Result<WriteOutcome, StorageError> {
    let mut state = self.state.lock();
    ensure_open(&state)?;
    let exists = state.sessions.contains_key(&session.key);
    let outcome = match (exists, mode) {
      (false, _) => WriteOutcome::Inserted,
      (true, WriteMode::InsertIfAbsent) => return Ok(WriteOutcome::AlreadyPresent),
      (true, WriteMode::Overwrite) => WriteOutcome::Updated,
    };
    state.sessions.insert(session.key, session.clone());
    Ok(outcome)
  }

  async fn delete_sessions_ended_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    let mut state = self.state.lock();
    ensure_open(&state)?;
    let before = state.sessions.len();
    state.sessions.retain(|_, s| s.ends_at >= cutoff);
    Ok(before - state.sessions.len())
  }

  async fn session_counts(
    &self,
    now: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
  ) -> Result<SessionCounts, StorageError> {
    let state = self.state.lock();
    ensure_open(&state)?;
    Ok(SessionCounts {
      total_sessions: state.sessions.len(),
      upcoming_sessions: state
        .sessions
        .keys()
        .filter(|k| k.starts_at >= now && k.starts_at < horizon_end)
        .count(),
      active_templates: state.templates.values().filter(|t| t.active).count(),
    })
  }

  async fn disconnect(&self) -> Result<(), StorageError> {
    let mut state = self.state.lock();
    if !state.closed {
      debug!("Closing in-memory storage.");
      state.closed = true;
    }
    Ok(())
  }
}
