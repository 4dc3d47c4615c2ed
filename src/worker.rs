use crate::clock::Clock;
use crate::command::ExecutionReport;
use crate::job::{BoxedTask, ExecutionOutcome, FireSource, RunId};
use crate::metrics::SchedulerMetrics;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

/// A single execution of a job's task.
///
/// The Coordinator marks the job `Running` before spawning an `Execution`, and
/// only the `ExecutionReport` sent back at the end moves it to `Idle` again.
/// The task is run in its own Tokio task so that a panic is contained and
/// reported instead of unwinding into the scheduler.
pub(crate) struct Execution {
  pub job: String,
  pub run_id: RunId,
  pub source: FireSource,
  pub task: Arc<BoxedTask>,
  pub metrics: SchedulerMetrics,
  pub report_tx: mpsc::UnboundedSender<ExecutionReport>,
  pub clock: Arc<dyn Clock>,
}

impl Execution {
  /// Spawns the execution onto the current runtime, instrumented with a `job_exec` span.
  pub fn spawn(self) {
    let span = tracing::info_span!(
      "job_exec",
      job = self.job.as_str(),
      run_id = %self.run_id,
      source = ?self.source,
    );
    tokio::spawn(self.run().instrument(span));
  }

  async fn run(self) {
    info!("Starting job execution.");
    let started_at = self.clock.now();
    let start_instant = Instant::now();

    let outcome = self.execute_task().await;
    let duration = start_instant.elapsed();

    self.metrics.execution_duration.record(duration);
    match &outcome {
      ExecutionOutcome::Succeeded => {
        self
          .metrics
          .executions_succeeded
          .fetch_add(1, AtomicOrdering::Relaxed);
        info!(duration_ms = duration.as_millis() as u64, outcome = outcome.label(), "Finished job execution.");
      }
      ExecutionOutcome::Failed(message) => {
        self
          .metrics
          .executions_failed
          .fetch_add(1, AtomicOrdering::Relaxed);
        warn!(
          duration_ms = duration.as_millis() as u64,
          outcome = outcome.label(),
          error = %message,
          "Job execution failed."
        );
      }
      ExecutionOutcome::Panicked => {
        self
          .metrics
          .executions_panicked
          .fetch_add(1, AtomicOrdering::Relaxed);
        error!(duration_ms = duration.as_millis() as u64, outcome = outcome.label(), "Job execution panicked.");
      }
    }

    let report = ExecutionReport {
      job: self.job,
      run_id: self.run_id,
      source: self.source,
      started_at,
      duration,
      outcome,
    };
    if self.report_tx.send(report).is_err() {
      // Coordinator is gone, nobody is left to observe the run state.
      warn!("Failed to report job outcome to coordinator (scheduler likely shut down).");
    }
  }

  /// Runs the task future, converting errors and panics into an outcome.
  async fn execute_task(&self) -> ExecutionOutcome {
    let future_to_run = (self.task)();

    #[cfg(feature = "job_context")]
    let handle = {
      let context = JobContext {
        job_name: self.job.clone(),
        run_id: self.run_id,
        source: self.source,
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, future_to_run))
    };
    #[cfg(not(feature = "job_context"))]
    let handle = tokio::spawn(future_to_run);

    match handle.await {
      Ok(Ok(())) => ExecutionOutcome::Succeeded,
      Ok(Err(e)) => ExecutionOutcome::Failed(format!("{:#}", e)),
      Err(join_error) if join_error.is_panic() => ExecutionOutcome::Panicked,
      Err(join_error) => {
        // Only happens when the runtime itself is shutting down.
        warn!(error = %join_error, "Job task was cancelled during execution.");
        ExecutionOutcome::Failed("task cancelled by runtime".to_string())
      }
    }
  }
}
