use super::{
  Session, SessionCounts, SessionKey, SessionTemplate, Storage, WriteMode, WriteOutcome,
};
use crate::error::StorageError;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_templates (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  weekdays TEXT NOT NULL,
  start_time TEXT NOT NULL,
  duration_minutes INTEGER NOT NULL,
  timezone TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS sessions (
  template_id INTEGER NOT NULL,
  starts_at INTEGER NOT NULL,
  id TEXT NOT NULL,
  ends_at INTEGER NOT NULL,
  generated_at INTEGER NOT NULL,
  PRIMARY KEY (template_id, starts_at)
);
CREATE INDEX IF NOT EXISTS idx_sessions_ends_at ON sessions(ends_at);
";

const WEEKDAYS: [Weekday; 7] = [
  Weekday::Mon,
  Weekday::Tue,
  Weekday::Wed,
  Weekday::Thu,
  Weekday::Fri,
  Weekday::Sat,
  Weekday::Sun,
];

const TIME_FORMAT: &str = "%H:%M:%S";

/// SQLite-backed storage.
///
/// The `(template_id, starts_at)` primary key is what makes concurrent
/// generation runs safe: a second insert of the same key is a no-op.
/// Every statement runs on the blocking pool so a busy database never stalls
/// the runtime's worker threads.
pub struct SqliteStorage {
  conn: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for SqliteStorage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SqliteStorage")
      .field("open", &self.conn.lock().is_some())
      .finish()
  }
}

impl SqliteStorage {
  /// Opens (or creates) the database at `path` and applies the schema.
  /// `":memory:"` opens a private in-memory database.
  pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
    let path = path.as_ref();
    let conn = if path.as_os_str() == ":memory:" {
      Connection::open_in_memory()?
    } else {
      Connection::open(path)?
    };
    Self::init_schema(&conn)?;
    info!(path = %path.display(), "Connected to session storage.");
    Ok(Self {
      conn: Arc::new(Mutex::new(Some(conn))),
    })
  }

  fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
      return Err(StorageError::Corrupt(format!(
        "database version {} is newer than supported version {}",
        version, SCHEMA_VERSION
      )));
    }
    conn.execute_batch(SCHEMA)?;
    if version < SCHEMA_VERSION {
      conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
      debug!(from = version, to = SCHEMA_VERSION, "Applied storage schema.");
    }
    Ok(())
  }

  /// Runs `f` against the open connection on the blocking pool, or fails
  /// with `Closed`.
  async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
  {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || {
      let guard = conn.lock();
      let conn = guard.as_ref().ok_or(StorageError::Closed)?;
      f(conn)
    })
    .await
    .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
  }

  /// Reads back a single stored session.
  pub async fn load_session(&self, key: &SessionKey) -> Result<Option<Session>, StorageError> {
    let key = *key;
    self
      .with_conn(move |conn| {
        let row = conn
          .query_row(
            "SELECT template_id, starts_at, ends_at, generated_at FROM sessions
             WHERE template_id = ?1 AND starts_at = ?2",
            params![key.template_id, key.starts_at.timestamp()],
            |row| {
              Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
              ))
            },
          )
          .optional()?;
        row
          .map(|(template_id, starts_at, ends_at, generated_at)| {
            Ok(Session {
              key: SessionKey::new(template_id, from_unix(starts_at)?),
              ends_at: from_unix(ends_at)?,
              generated_at: from_unix(generated_at)?,
            })
          })
          .transpose()
      })
      .await
  }
}

fn encode_weekdays(days: &[Weekday]) -> String {
  days
    .iter()
    .map(|d| d.num_days_from_monday().to_string())
    .collect::<Vec<_>>()
    .join(",")
}

fn decode_weekdays(raw: &str) -> Result<Vec<Weekday>, StorageError> {
  raw
    .split(',')
    .filter(|part| !part.trim().is_empty())
    .map(|part| {
      part
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|idx| WEEKDAYS.get(idx).copied())
        .ok_or_else(|| StorageError::Corrupt(format!("invalid weekday '{}'", part)))
    })
    .collect()
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>, StorageError> {
  DateTime::from_timestamp(secs, 0)
    .ok_or_else(|| StorageError::Corrupt(format!("timestamp {} out of range", secs)))
}

#[async_trait]
impl Storage for SqliteStorage {
  async fn active_templates(&self) -> Result<Vec<SessionTemplate>, StorageError> {
    self
      .with_conn(|conn| {
        let mut stmt = conn.prepare(
          "SELECT id, name, weekdays, start_time, duration_minutes, timezone, active
           FROM session_templates WHERE active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, u32>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, bool>(6)?,
          ))
        })?;

        let mut templates = Vec::new();
        for row in rows {
          let (id, name, weekdays, start_time, duration_minutes, timezone, active) = row?;
          let start_time = NaiveTime::parse_from_str(&start_time, TIME_FORMAT).map_err(|e| {
            StorageError::Corrupt(format!("template {} has invalid start time: {}", id, e))
          })?;
          templates.push(SessionTemplate {
            id,
            name,
            weekdays: decode_weekdays(&weekdays)?,
            start_time,
            duration_minutes,
            timezone,
            active,
          });
        }
        Ok(templates)
      })
      .await
  }

  async fn upsert_template(&self, template: &SessionTemplate) -> Result<(), StorageError> {
    let template = template.clone();
    self
      .with_conn(move |conn| {
        conn.execute(
          "INSERT INTO session_templates
             (id, name, weekdays, start_time, duration_minutes, timezone, active)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
           ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             weekdays = excluded.weekdays,
             start_time = excluded.start_time,
             duration_minutes = excluded.duration_minutes,
             timezone = excluded.timezone,
             active = excluded.active",
          params![
            template.id,
            template.name,
            encode_weekdays(&template.weekdays),
            template.start_time.format(TIME_FORMAT).to_string(),
            template.duration_minutes,
            template.timezone,
            template.active,
          ],
        )?;
        Ok(())
      })
      .await
  }

  async fn existing_keys(&self, keys: &[SessionKey]) -> Result<HashSet<SessionKey>, StorageError> {
    let keys = keys.to_vec();
    self
      .with_conn(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT 1 FROM sessions WHERE template_id = ?1 AND starts_at = ?2",
        )?;
        let mut found = HashSet::new();
        for key in keys {
          let hit = stmt
            .query_row(params![key.template_id, key.starts_at.timestamp()], |_| Ok(()))
            .optional()?;
          if hit.is_some() {
            found.insert(key);
          }
        }
        Ok(found)
      })
      .await
  }

  async fn write_session(
    &self,
    session: &Session,
    mode: WriteMode,
  ) -> Result<WriteOutcome, StorageError> {
    let session = session.clone();
    self
      .with_conn(move |conn| {
        let key = &session.key;
        let inserted = conn.execute(
          "INSERT INTO sessions (template_id, starts_at, id, ends_at, generated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(template_id, starts_at) DO NOTHING",
          params![
            key.template_id,
            key.starts_at.timestamp(),
            session.id().to_string(),
            session.ends_at.timestamp(),
            session.generated_at.timestamp(),
          ],
        )?;
        if inserted > 0 {
          return Ok(WriteOutcome::Inserted);
        }
        match mode {
          WriteMode::InsertIfAbsent => Ok(WriteOutcome::AlreadyPresent),
          WriteMode::Overwrite => {
            conn.execute(
              "UPDATE sessions SET ends_at = ?3, generated_at = ?4
               WHERE template_id = ?1 AND starts_at = ?2",
              params![
                key.template_id,
                key.starts_at.timestamp(),
                session.ends_at.timestamp(),
                session.generated_at.timestamp(),
              ],
            )?;
            Ok(WriteOutcome::Updated)
          }
        }
      })
      .await
  }

  async fn delete_sessions_ended_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    self
      .with_conn(move |conn| {
        let deleted = conn.execute(
          "DELETE FROM sessions WHERE ends_at < ?1",
          params![cutoff.timestamp()],
        )?;
        Ok(deleted)
      })
      .await
  }

  async fn session_counts(
    &self,
    now: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
  ) -> Result<SessionCounts, StorageError> {
    self
      .with_conn(move |conn| {
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        let upcoming: i64 = conn.query_row(
          "SELECT COUNT(*) FROM sessions WHERE starts_at >= ?1 AND starts_at < ?2",
          params![now.timestamp(), horizon_end.timestamp()],
          |row| row.get(0),
        )?;
        let templates: i64 = conn.query_row(
          "SELECT COUNT(*) FROM session_templates WHERE active = 1",
          [],
          |row| row.get(0),
        )?;
        Ok(SessionCounts {
          total_sessions: total as usize,
          upcoming_sessions: upcoming as usize,
          active_templates: templates as usize,
        })
      })
      .await
  }

  async fn disconnect(&self) -> Result<(), StorageError> {
    let conn = self.conn.clone();
    tokio::task::spawn_blocking(move || match conn.lock().take() {
      Some(conn) => {
        if let Err((_conn, e)) = conn.close() {
          warn!(error = %e, "Session storage did not close cleanly.");
          return Err(StorageError::Sqlite(e));
        }
        info!("Session storage disconnected.");
        Ok(())
      }
      None => {
        debug!("Session storage already disconnected.");
        Ok(())
      }
    })
    .await
    .map_err(|e| StorageError::Unavailable(format!("storage task failed: {}", e)))?
  }
}
