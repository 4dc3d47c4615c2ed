use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without detailed percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total sum of recorded durations in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Scheduler metrics backed by atomic counters.
///
/// Cloning only clones the `Arc`s, so the Coordinator and execution tasks share
/// the same underlying values.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Counters (Monotonically increasing) ---
  /// Timer firings observed, including skipped ones.
  pub firings_total: Arc<AtomicUsize>,
  /// Firings dropped because the previous execution was still running.
  pub firings_skipped_running: Arc<AtomicUsize>,
  /// Manual triggers received through `trigger_now`.
  pub manual_triggers: Arc<AtomicUsize>,
  pub executions_succeeded: Arc<AtomicUsize>,
  pub executions_failed: Arc<AtomicUsize>,
  pub executions_panicked: Arc<AtomicUsize>,

  // --- Gauges (Current state values) ---
  /// Jobs whose timer is currently active.
  pub jobs_active_current: Arc<AtomicUsize>,
  /// Executions currently in flight.
  pub executions_running_current: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  pub execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      firings_total: self.firings_total.load(order),
      firings_skipped_running: self.firings_skipped_running.load(order),
      manual_triggers: self.manual_triggers.load(order),
      executions_succeeded: self.executions_succeeded.load(order),
      executions_failed: self.executions_failed.load(order),
      executions_panicked: self.executions_panicked.load(order),
      jobs_active_current: self.jobs_active_current.load(order),
      executions_running_current: self.executions_running_current.load(order),
      execution_duration_count: self.execution_duration.get_count(),
      execution_duration_sum_micros: self.execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
  // Counters
  pub firings_total: usize,
  pub firings_skipped_running: usize,
  pub manual_triggers: usize,
  pub executions_succeeded: usize,
  pub executions_failed: usize,
  pub executions_panicked: usize,
  // Gauges
  pub jobs_active_current: usize,
  pub executions_running_current: usize,
  // Histogram Data
  pub execution_duration_count: usize,
  pub execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Total completed executions regardless of outcome.
  pub fn executions_completed(&self) -> usize {
    self.executions_succeeded + self.executions_failed + self.executions_panicked
  }

  /// Mean execution duration, if any execution completed.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.execution_duration_count == 0 {
      None
    } else {
      let micros = self.execution_duration_sum_micros as f64 / self.execution_duration_count as f64;
      Some(Duration::from_micros(micros as u64))
    }
  }
}
