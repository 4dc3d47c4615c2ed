//! Wall-clock source for fire time computation.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

/// Supplies "now" to the Coordinator and to executions.
pub trait Clock: Send + Sync + fmt::Debug {
  fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock. Used unless a builder overrides it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Wall time that advances with Tokio's timer from a fixed starting point.
///
/// Under a paused runtime (`tokio::time::pause`, or
/// `#[tokio::test(start_paused = true)]`) time only moves when every task is
/// idle, so timer firings and execution overlaps become reproducible.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
  anchor: DateTime<Utc>,
  started: Instant,
}

impl TokioClock {
  pub fn starting_at(anchor: DateTime<Utc>) -> Self {
    Self {
      anchor,
      started: Instant::now(),
    }
  }
}

impl Clock for TokioClock {
  fn now(&self) -> DateTime<Utc> {
    match ChronoDuration::from_std(self.started.elapsed()) {
      Ok(elapsed) => self.anchor + elapsed,
      Err(_) => self.anchor,
    }
  }
}
