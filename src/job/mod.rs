#[cfg(feature = "job_context")]
pub mod context;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

// --- Public Type Aliases ---

/// Unique identifier of a single execution of a job. Uses UUID v4.
pub type RunId = Uuid;

/// The future returned by a job task for one execution.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// The function type that recurring jobs execute.
///
/// The function must be `Send + Sync + 'static` and return a boxed `Future`
/// resolving to `anyhow::Result<()>`:
/// - `Ok(())` indicates the execution succeeded.
/// - `Err(_)` is a reported failure; it is logged and isolated to that firing.
///
/// Panics within the future are caught by the scheduler and reported as
/// [`ExecutionOutcome::Panicked`].
pub type BoxedTask = Box<dyn Fn() -> TaskFuture + Send + Sync + 'static>;

// --- Fire Time Computation ---

/// Computes the next fire time of a recurring job.
///
/// This is the only thing the scheduler needs to know about a schedule, which
/// keeps the timer mechanism separate from exclusivity and skip handling.
pub trait NextFire: Send + Sync + 'static {
  /// Returns the first fire time strictly after `after`, or `None` if the
  /// schedule has no further firings.
  fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// A parsed cron expression evaluated in a specific timezone.
#[derive(Clone)]
pub struct CronSpec {
  expression: String,
  timezone: Tz,
  parsed: CronSchedule,
}

impl CronSpec {
  /// Parses a cron expression (seconds field first, `cron` crate syntax) and an
  /// IANA timezone name such as `"UTC"` or `"Europe/Rome"`.
  pub fn parse(expression: &str, timezone: &str) -> Result<Self, String> {
    let parsed = CronSchedule::from_str(expression)
      .map_err(|e| format!("invalid cron expression '{}': {}", expression, e))?;
    let timezone = timezone
      .parse::<Tz>()
      .map_err(|_| format!("unknown timezone '{}'", timezone))?;
    Ok(Self {
      expression: expression.to_string(),
      timezone,
      parsed,
    })
  }

  pub fn expression(&self) -> &str {
    &self.expression
  }

  pub fn timezone(&self) -> Tz {
    self.timezone
  }
}

impl fmt::Debug for CronSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CronSpec")
      .field("expression", &self.expression)
      .field("timezone", &self.timezone)
      .finish()
  }
}

impl NextFire for CronSpec {
  fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&self.timezone);
    self
      .parsed
      .after(&local)
      .next()
      .map(|dt| dt.with_timezone(&Utc))
  }
}

/// The schedule kinds understood by the scheduler out of the box.
#[derive(Debug, Clone)]
pub enum Schedule {
  /// Fire according to a cron expression in a given timezone.
  Cron(CronSpec),
  /// Fire repeatedly at a fixed interval after the previous fire time.
  FixedInterval(StdDuration),
  /// Never fire on a timer; only manual triggers run the job.
  Never,
}

impl Schedule {
  pub fn cron(expression: &str, timezone: &str) -> Result<Self, String> {
    CronSpec::parse(expression, timezone).map(Schedule::Cron)
  }

  /// Human readable form used in status snapshots and logs.
  pub fn describe(&self) -> String {
    match self {
      Schedule::Cron(spec) => format!("cron '{}' ({})", spec.expression, spec.timezone),
      Schedule::FixedInterval(interval) => format!("every {:?}", interval),
      Schedule::Never => "manual only".to_string(),
    }
  }
}

impl NextFire for Schedule {
  fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Schedule::Cron(spec) => spec.next_fire_after(after),
      Schedule::FixedInterval(interval) => match ChronoDuration::from_std(*interval) {
        Ok(chrono_interval) if chrono_interval > ChronoDuration::zero() => {
          after.checked_add_signed(chrono_interval)
        }
        Ok(_) => {
          warn!("Zero fixed interval has no next fire time.");
          None
        }
        Err(e) => {
          warn!("Failed to convert interval duration {:?}: {}", interval, e);
          None
        }
      },
      Schedule::Never => None,
    }
  }
}

// --- Core Job Structures ---

/// Internal definition of a registered job. Lives in the Coordinator's registry.
pub(crate) struct JobDefinition {
  pub name: String,
  pub schedule: Arc<dyn NextFire>,
  pub schedule_description: String,
  pub task: Arc<BoxedTask>,
}

impl fmt::Debug for JobDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobDefinition")
      .field("name", &self.name)
      .field("schedule", &self.schedule_description)
      .field("task", &format_args!("Arc<BoxedTask>"))
      .finish()
  }
}

// --- Execution Outcomes & Events ---

/// How a single execution of a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ExecutionOutcome {
  Succeeded,
  /// The task returned an error; the message is the error's display chain.
  Failed(String),
  Panicked,
}

impl ExecutionOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, ExecutionOutcome::Succeeded)
  }

  pub(crate) fn label(&self) -> &'static str {
    match self {
      ExecutionOutcome::Succeeded => "Success",
      ExecutionOutcome::Failed(_) => "Fail",
      ExecutionOutcome::Panicked => "Panic",
    }
  }
}

/// Why a firing did not start an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
  AlreadyRunning,
}

/// What caused a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireSource {
  Timer,
  Manual,
}

/// Events broadcast by the scheduler for every firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
  Started {
    job: String,
    run_id: RunId,
    source: FireSource,
  },
  Skipped {
    job: String,
    source: FireSource,
    reason: SkipReason,
  },
  Completed {
    job: String,
    run_id: RunId,
    duration: StdDuration,
    outcome: ExecutionOutcome,
  },
}

impl JobEvent {
  pub fn job(&self) -> &str {
    match self {
      JobEvent::Started { job, .. } | JobEvent::Skipped { job, .. } | JobEvent::Completed { job, .. } => job,
    }
  }
}

/// Result of a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TriggerResult {
  Started { run_id: RunId },
  Skipped { reason: SkipReason },
}

// --- Public Snapshot Structs for Querying ---

/// Summary of the most recent completed execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastRun {
  pub run_id: RunId,
  pub started_at: DateTime<Utc>,
  pub duration_ms: u64,
  pub outcome: ExecutionOutcome,
}

/// Point-in-time status of a registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
  pub name: String,
  pub schedule: String,
  /// Whether the job's timer is active.
  pub active: bool,
  /// The next time the timer fires. `None` while inactive.
  pub next_fire_time: Option<DateTime<Utc>>,
  /// Whether an execution is in flight right now.
  pub running: bool,
  pub last_run: Option<LastRun>,
}
