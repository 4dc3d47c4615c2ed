use crate::error::SchedulerError;
use crate::job::{ExecutionOutcome, FireSource, JobDefinition, JobStatus, RunId, TriggerResult};
use crate::metrics::MetricsSnapshot;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Commands sent from the `JobScheduler` handle to the central Coordinator task.
///
/// Each command includes a `oneshot::Sender` for the Coordinator to send the
/// response back to the requesting task.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Store a new job definition in the `Idle`, inactive state.
  Register {
    definition: JobDefinition,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
  },
  /// Activate the timer of a job. No-op if already active.
  Start {
    name: String,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
  },
  /// Deactivate the timer of a job. No-op if already inactive.
  Stop {
    name: String,
    responder: oneshot::Sender<Result<(), SchedulerError>>,
  },
  /// Deactivate every job's timer. Responds with the number of executions still in flight.
  StopAll { responder: oneshot::Sender<usize> },
  /// Fire a job right now through the normal exclusivity check.
  TriggerNow {
    name: String,
    responder: oneshot::Sender<Result<TriggerResult, SchedulerError>>,
  },
  GetStatus {
    name: String,
    responder: oneshot::Sender<Result<JobStatus, SchedulerError>>,
  },
  ListJobs { responder: oneshot::Sender<Vec<JobStatus>> },
  GetMetricsSnapshot { responder: oneshot::Sender<MetricsSnapshot> },
  /// Stop every timer, unregister every job and end the Coordinator task.
  /// Responds with the number of executions still in flight.
  Shutdown { responder: oneshot::Sender<usize> },
}

/// Message sent from an execution task back to the Coordinator once the job's
/// task has finished (successfully, with an error, or by panicking).
#[derive(Debug)]
pub(crate) struct ExecutionReport {
  pub job: String,
  pub run_id: RunId,
  pub source: FireSource,
  pub started_at: DateTime<Utc>,
  pub duration: Duration,
  pub outcome: ExecutionOutcome,
}
