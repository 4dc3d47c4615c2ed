use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, SecondsFormat, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving session ids from their key. Changing it changes
/// every generated id, so it is fixed forever.
const SESSION_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_3c2a_9b4e_4d7f_8a21_5c0e_d9b3_7a64);

/// A recurring source definition: "every <weekdays> at <start_time> in <timezone>".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTemplate {
  pub id: i64,
  pub name: String,
  pub weekdays: Vec<Weekday>,
  pub start_time: NaiveTime,
  pub duration_minutes: u32,
  /// IANA timezone the `start_time` is expressed in.
  pub timezone: String,
  pub active: bool,
}

impl SessionTemplate {
  /// A template that occurs on every day of the week.
  pub fn daily(id: i64, name: &str, start_time: NaiveTime, duration_minutes: u32) -> Self {
    Self {
      id,
      name: name.to_string(),
      weekdays: vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
      ],
      start_time,
      duration_minutes,
      timezone: "UTC".to_string(),
      active: true,
    }
  }
}

/// The idempotency key of a generated session.
///
/// A pure function of the template and the occurrence instant, truncated to
/// whole seconds so keys compare equal after a storage round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
  pub template_id: i64,
  pub starts_at: DateTime<Utc>,
}

impl SessionKey {
  pub fn new(template_id: i64, starts_at: DateTime<Utc>) -> Self {
    let starts_at = DateTime::from_timestamp(starts_at.timestamp(), 0).unwrap_or(starts_at);
    Self {
      template_id,
      starts_at,
    }
  }

  /// Deterministic session id (UUID v5) derived from the key.
  pub fn id(&self) -> Uuid {
    let name = format!(
      "{}:{}",
      self.template_id,
      self.starts_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    Uuid::new_v5(&SESSION_ID_NAMESPACE, name.as_bytes())
  }
}

/// A generated unit: one concrete occurrence of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub key: SessionKey,
  pub ends_at: DateTime<Utc>,
  pub generated_at: DateTime<Utc>,
}

impl Session {
  pub fn new(key: SessionKey, duration_minutes: u32, generated_at: DateTime<Utc>) -> Self {
    Self {
      key,
      ends_at: key.starts_at + ChronoDuration::minutes(i64::from(duration_minutes)),
      generated_at,
    }
  }

  pub fn id(&self) -> Uuid {
    self.key.id()
  }
}

/// How `Storage::write_session` treats a key that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
  /// Leave an existing session untouched.
  InsertIfAbsent,
  /// Overwrite an existing session in place (same key, same id).
  Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  Inserted,
  Updated,
  AlreadyPresent,
}

/// Aggregate counts used for generation diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionCounts {
  pub total_sessions: usize,
  /// Sessions starting in `[now, horizon_end)`.
  pub upcoming_sessions: usize,
  pub active_templates: usize,
}
