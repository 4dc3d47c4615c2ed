//! Window-based session generation.
//!
//! A run materializes every occurrence of every active template inside
//! `[today, today + weeks_ahead * 7 days)`. Coverage is checked per session
//! key, so re-running over an already covered window creates nothing.

use crate::error::{GenerationError, StorageError};
use crate::storage::{Session, SessionKey, SessionTemplate, Storage, WriteMode, WriteOutcome};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

/// How far ahead `stats()` counts sessions as upcoming.
pub const STATS_HORIZON_DAYS: i64 = 28;

/// The date range covered by one generation run. `to` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationWindow {
  pub from: NaiveDate,
  pub to: NaiveDate,
  pub skip_existing: bool,
}

impl GenerationWindow {
  pub fn new(today: NaiveDate, weeks_ahead: u32, skip_existing: bool) -> Result<Self, GenerationError> {
    if weeks_ahead == 0 {
      return Err(GenerationError::InvalidWindow(weeks_ahead));
    }
    Ok(Self {
      from: today,
      to: today + ChronoDuration::weeks(i64::from(weeks_ahead)),
      skip_existing,
    })
  }

  pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
    self.from.iter_days().take_while(move |d| *d < self.to)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
  pub window: GenerationWindow,
  /// Occurrences enumerated from active templates.
  pub candidates: usize,
  /// Occurrences that were already stored and left untouched.
  pub existing: usize,
  pub created: usize,
  /// Occurrences overwritten in place (only when `skip_existing` is false).
  pub updated: usize,
  #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
  pub duration: StdDuration,
}

fn serialize_millis<S: serde::Serializer>(d: &StdDuration, s: S) -> Result<S::Ok, S::Error> {
  s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationStats {
  pub total_sessions: usize,
  /// Sessions starting within the next [`STATS_HORIZON_DAYS`] days.
  pub future_sessions: usize,
  pub active_template_count: usize,
}

/// Every occurrence of `template` on the dates of `window`, in UTC.
///
/// Local start times that do not exist (DST gap) are skipped; ambiguous ones
/// resolve to the earliest instant. A template with an unknown timezone yields
/// nothing.
pub fn occurrences(template: &SessionTemplate, window: &GenerationWindow) -> Vec<DateTime<Utc>> {
  let tz = match template.timezone.parse::<chrono_tz::Tz>() {
    Ok(tz) => tz,
    Err(e) => {
      warn!(
        template_id = template.id,
        timezone = %template.timezone,
        error = %e,
        "Skipping template with invalid timezone."
      );
      return Vec::new();
    }
  };

  window
    .dates()
    .filter(|date| template.weekdays.contains(&date.weekday()))
    .filter_map(|date| {
      let local = date.and_time(template.start_time);
      let resolved = tz.from_local_datetime(&local).earliest();
      if resolved.is_none() {
        debug!(template_id = template.id, %local, "Local start time does not exist, skipping.");
      }
      resolved.map(|dt| dt.with_timezone(&Utc))
    })
    .collect()
}

/// Produces the missing sessions of a date window.
#[derive(Clone)]
pub struct WindowGenerator {
  storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for WindowGenerator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WindowGenerator").finish_non_exhaustive()
  }
}

impl WindowGenerator {
  pub fn new(storage: Arc<dyn Storage>) -> Self {
    Self { storage }
  }

  /// Generates the window starting today (UTC).
  pub async fn generate(
    &self,
    weeks_ahead: u32,
    skip_existing: bool,
  ) -> Result<GenerationReport, GenerationError> {
    self
      .generate_from(Utc::now().date_naive(), weeks_ahead, skip_existing)
      .await
  }

  /// Generates the window starting at `today`.
  ///
  /// With `skip_existing` the stored coverage is consulted first and only
  /// missing keys are written. Without it every occurrence is written in
  /// overwrite mode, which refreshes rows in place but never duplicates them.
  /// Sessions that no longer match any template are left alone either way.
  ///
  /// Writes are not transactional: on a storage failure the remaining units
  /// are still attempted and the error reports how many were created.
  #[instrument(level = "info", skip(self))]
  pub async fn generate_from(
    &self,
    today: NaiveDate,
    weeks_ahead: u32,
    skip_existing: bool,
  ) -> Result<GenerationReport, GenerationError> {
    let started = Instant::now();
    let window = GenerationWindow::new(today, weeks_ahead, skip_existing)?;

    let templates = self
      .storage
      .active_templates()
      .await
      .map_err(GenerationError::Storage)?;

    let generated_at = Utc::now();
    let mut candidates: Vec<Session> = Vec::new();
    for template in &templates {
      for starts_at in occurrences(template, &window) {
        let key = SessionKey::new(template.id, starts_at);
        candidates.push(Session::new(key, template.duration_minutes, generated_at));
      }
    }

    let existing_keys: HashSet<SessionKey> = if skip_existing {
      let keys: Vec<SessionKey> = candidates.iter().map(|s| s.key).collect();
      self
        .storage
        .existing_keys(&keys)
        .await
        .map_err(GenerationError::Storage)?
    } else {
      HashSet::new()
    };

    let mode = if skip_existing {
      WriteMode::InsertIfAbsent
    } else {
      WriteMode::Overwrite
    };

    let mut existing = existing_keys.len();
    let mut created = 0usize;
    let mut updated = 0usize;
    let mut first_error: Option<StorageError> = None;
    let mut failures = 0usize;

    for session in candidates.iter().filter(|s| !existing_keys.contains(&s.key)) {
      match self.storage.write_session(session, mode).await {
        Ok(WriteOutcome::Inserted) => created += 1,
        Ok(WriteOutcome::Updated) => updated += 1,
        // Another run wrote this key between our read and our write.
        Ok(WriteOutcome::AlreadyPresent) => existing += 1,
        Err(e) => {
          failures += 1;
          warn!(
            template_id = session.key.template_id,
            starts_at = %session.key.starts_at,
            error = %e,
            "Failed to write session."
          );
          first_error.get_or_insert(e);
        }
      }
    }

    if let Some(source) = first_error {
      error!(
        created,
        failures,
        from = %window.from,
        to = %window.to,
        "Generation batch partially failed."
      );
      return Err(GenerationError::PartialBatch { created, source });
    }

    let report = GenerationReport {
      window,
      candidates: candidates.len(),
      existing,
      created,
      updated,
      duration: started.elapsed(),
    };
    info!(
      from = %window.from,
      to = %window.to,
      templates = templates.len(),
      candidates = report.candidates,
      existing = report.existing,
      created = report.created,
      updated = report.updated,
      duration_ms = report.duration.as_millis() as u64,
      "Generation run finished."
    );
    Ok(report)
  }

  /// Current coverage numbers, or `None` if storage could not be read.
  pub async fn stats(&self) -> Option<GenerationStats> {
    let now = Utc::now();
    let horizon_end = now + ChronoDuration::days(STATS_HORIZON_DAYS);
    match self.storage.session_counts(now, horizon_end).await {
      Ok(counts) => Some(GenerationStats {
        total_sessions: counts.total_sessions,
        future_sessions: counts.upcoming_sessions,
        active_template_count: counts.active_templates,
      }),
      Err(e) => {
        error!(error = %e, "Failed to read generation stats.");
        None
      }
    }
  }
}
