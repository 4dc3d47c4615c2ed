//! Persistent storage collaborator.
//!
//! The process opens exactly one storage handle at boot and shares it as an
//! `Arc<dyn Storage>`; the shutdown sequence disconnects it once, after which
//! every call fails with [`StorageError::Closed`].

mod memory;
mod models;
mod sqlite;

pub use memory::MemoryStorage;
pub use models::{
  Session, SessionCounts, SessionKey, SessionTemplate, WriteMode, WriteOutcome,
};
pub use sqlite::SqliteStorage;

use crate::error::StorageError;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Storage: Send + Sync {
  /// Templates currently marked active.
  async fn active_templates(&self) -> Result<Vec<SessionTemplate>, StorageError>;

  /// Inserts or replaces a template definition.
  async fn upsert_template(&self, template: &SessionTemplate) -> Result<(), StorageError>;

  /// The subset of `keys` that already have a stored session.
  async fn existing_keys(&self, keys: &[SessionKey]) -> Result<HashSet<SessionKey>, StorageError>;

  /// Writes one session. Uniqueness of `session.key` is enforced here, so
  /// concurrent writers of the same key never produce two rows.
  async fn write_session(
    &self,
    session: &Session,
    mode: WriteMode,
  ) -> Result<WriteOutcome, StorageError>;

  /// Deletes sessions that ended strictly before `cutoff`. Returns the number deleted.
  async fn delete_sessions_ended_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;

  async fn session_counts(
    &self,
    now: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
  ) -> Result<SessionCounts, StorageError>;

  /// Releases the underlying connection. Calling it again is a no-op.
  async fn disconnect(&self) -> Result<(), StorageError>;
}
