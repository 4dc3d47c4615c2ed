use crate::clock::{Clock, SystemClock};
use crate::command::CoordinatorCommand;
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::SchedulerError;
use crate::job::{
  BoxedTask, CronSpec, JobDefinition, JobEvent, JobStatus, NextFire, Schedule, TaskFuture,
  TriggerResult,
};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_COMMAND_BOUND: usize = 128;
const DEFAULT_EVENT_BOUND: usize = 256;

/// Builder for configuring and creating a `JobScheduler`.
///
/// # Example
///
/// ```no_run
/// use cadence::{job_fn, JobScheduler};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = JobScheduler::builder()
///     .command_buffer_size(64)
///     .build();
/// scheduler
///     .register("cleanup", "0 * * * * *", "UTC", job_fn! { { Ok(()) } })
///     .await?;
/// scheduler.start("cleanup").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SchedulerBuilder {
  command_buffer_size: usize,
  event_buffer_size: usize,
  clock: Arc<dyn Clock>,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      command_buffer_size: DEFAULT_COMMAND_BOUND,
      event_buffer_size: DEFAULT_EVENT_BOUND,
      clock: Arc::new(SystemClock),
    }
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the size of the internal buffer for commands sent to the Coordinator.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Sets how many `JobEvent`s a slow subscriber may lag behind before it
  /// starts missing events.
  pub fn event_buffer_size(mut self, size: usize) -> Self {
    self.event_buffer_size = size.max(1);
    self
  }

  /// Replaces the wall clock used to compute fire times and stamp runs.
  pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  /// Builds the scheduler and spawns its Coordinator task on the current runtime.
  ///
  /// # Panics
  ///
  /// Panics if called outside a Tokio runtime.
  pub fn build(self) -> JobScheduler {
    let metrics = SchedulerMetrics::new();
    let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(self.command_buffer_size);
    let (events_tx, _) = broadcast::channel::<JobEvent>(self.event_buffer_size);
    let (running_tx, running_rx) = watch::channel(0usize);

    let coordinator_state = CoordinatorState {
      cmd_rx,
      events_tx: events_tx.clone(),
      running_tx,
      metrics: metrics.clone(),
      clock: self.clock,
    };

    let coordinator_handle = Handle::current().spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
      info!("Coordinator task finished.");
    });

    JobScheduler {
      metrics,
      cmd_tx,
      events_tx,
      running_rx,
      coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
    }
  }
}

/// Handle to the recurring job scheduler.
///
/// Cheap to clone; every clone talks to the same Coordinator task. The
/// Coordinator exits on [`JobScheduler::shutdown`] or once the last handle
/// is dropped.
///
/// Guarantees:
/// - at most one execution per job is in flight at any time; a firing that
///   arrives while the job is running is dropped and reported as
///   [`JobEvent::Skipped`];
/// - task failures and panics are isolated to the firing that produced them.
#[derive(Debug, Clone)]
pub struct JobScheduler {
  metrics: SchedulerMetrics,
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
  events_tx: broadcast::Sender<JobEvent>,
  running_rx: watch::Receiver<usize>,
  coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobScheduler {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// Builds a scheduler with default settings.
  pub fn new() -> Self {
    SchedulerBuilder::new().build()
  }

  /// Registers a job fired by a cron expression evaluated in `timezone`.
  /// The job starts `Idle` and inactive; call [`JobScheduler::start`] to arm it.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::DuplicateJob`]: `name` is already registered.
  /// - [`SchedulerError::InvalidSchedule`]: the expression or timezone does not parse.
  pub async fn register(
    &self,
    name: &str,
    cron_expression: &str,
    timezone: &str,
    task: BoxedTask,
  ) -> Result<(), SchedulerError> {
    let spec = CronSpec::parse(cron_expression, timezone).map_err(|reason| {
      SchedulerError::InvalidSchedule {
        name: name.to_string(),
        reason,
      }
    })?;
    let schedule = Schedule::Cron(spec);
    let description = schedule.describe();
    self
      .register_definition(name, Arc::new(schedule), description, task)
      .await
  }

  /// Registers a job with one of the built-in [`Schedule`] kinds.
  pub async fn register_schedule(
    &self,
    name: &str,
    schedule: Schedule,
    task: BoxedTask,
  ) -> Result<(), SchedulerError> {
    let description = schedule.describe();
    self
      .register_definition(name, Arc::new(schedule), description, task)
      .await
  }

  /// Registers a job with a custom fire time computation.
  pub async fn register_with_schedule(
    &self,
    name: &str,
    schedule: Arc<dyn NextFire>,
    task: BoxedTask,
  ) -> Result<(), SchedulerError> {
    self
      .register_definition(name, schedule, "custom".to_string(), task)
      .await
  }

  /// Convenience wrapper around [`JobScheduler::register`] accepting any closure
  /// returning a [`TaskFuture`].
  pub async fn register_fn<F>(
    &self,
    name: &str,
    cron_expression: &str,
    timezone: &str,
    task: F,
  ) -> Result<(), SchedulerError>
  where
    F: Fn() -> TaskFuture + Send + Sync + 'static,
  {
    self
      .register(name, cron_expression, timezone, Box::new(task))
      .await
  }

  async fn register_definition(
    &self,
    name: &str,
    schedule: Arc<dyn NextFire>,
    schedule_description: String,
    task: BoxedTask,
  ) -> Result<(), SchedulerError> {
    let definition = JobDefinition {
      name: name.to_string(),
      schedule,
      schedule_description,
      task: Arc::new(task),
    };
    self
      .request(|responder| CoordinatorCommand::Register {
        definition,
        responder,
      })
      .await?
  }

  /// Activates the timer of a registered job. No-op if it is already active.
  ///
  /// # Errors
  ///
  /// - [`SchedulerError::UnknownJob`]: no job with that name.
  /// - [`SchedulerError::InvalidSchedule`]: the schedule yields no upcoming fire time.
  pub async fn start(&self, name: &str) -> Result<(), SchedulerError> {
    let name = name.to_string();
    self
      .request(|responder| CoordinatorCommand::Start { name, responder })
      .await?
  }

  /// Deactivates the timer of a job. An execution already in flight is not
  /// interrupted and runs to completion on its own. No-op if inactive.
  pub async fn stop(&self, name: &str) -> Result<(), SchedulerError> {
    let name = name.to_string();
    self
      .request(|responder| CoordinatorCommand::Stop { name, responder })
      .await?
  }

  /// Deactivates every job's timer without waiting for in-flight executions.
  /// Returns how many executions were still in flight at that moment.
  pub async fn stop_all(&self) -> Result<usize, SchedulerError> {
    self
      .request(|responder| CoordinatorCommand::StopAll { responder })
      .await
  }

  /// Stops every timer, unregisters every job and ends the Coordinator task.
  /// In-flight executions are not awaited; their count is returned. Every
  /// later call on any handle fails with [`SchedulerError::SchedulerShutdown`].
  pub async fn shutdown(&self) -> Result<usize, SchedulerError> {
    let in_flight = self
      .request(|responder| CoordinatorCommand::Shutdown { responder })
      .await?;
    let handle = self.coordinator_handle.lock().take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        warn!(error = %e, "Coordinator task ended abnormally.");
      }
    }
    Ok(in_flight)
  }

  /// Fires a job immediately through the same exclusivity check as the timer.
  /// Works whether or not the job's timer is active.
  pub async fn trigger_now(&self, name: &str) -> Result<TriggerResult, SchedulerError> {
    let name = name.to_string();
    self
      .request(|responder| CoordinatorCommand::TriggerNow { name, responder })
      .await?
  }

  pub async fn status(&self, name: &str) -> Result<JobStatus, SchedulerError> {
    let name = name.to_string();
    self
      .request(|responder| CoordinatorCommand::GetStatus { name, responder })
      .await?
  }

  /// Status of every registered job, sorted by name.
  pub async fn list_jobs(&self) -> Result<Vec<JobStatus>, SchedulerError> {
    self
      .request(|responder| CoordinatorCommand::ListJobs { responder })
      .await
  }

  pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, SchedulerError> {
    self
      .request(|responder| CoordinatorCommand::GetMetricsSnapshot { responder })
      .await
  }

  /// Subscribes to the stream of [`JobEvent`]s. Only events emitted after
  /// subscribing are received.
  pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
    self.events_tx.subscribe()
  }

  /// Number of executions currently in flight.
  pub fn running_count(&self) -> usize {
    *self.running_rx.borrow()
  }

  /// Waits until no execution is in flight, or `timeout` elapses.
  /// Returns `true` if the scheduler went idle in time.
  pub async fn wait_idle(&self, timeout: Duration) -> bool {
    let mut rx = self.running_rx.clone();
    tokio::time::timeout(timeout, rx.wait_for(|running| *running == 0))
      .await
      .map(|res| res.is_ok())
      .unwrap_or(false)
  }

  /// Whether the Coordinator task is still alive. `false` once
  /// [`JobScheduler::shutdown`] has returned.
  pub fn is_running(&self) -> bool {
    self
      .coordinator_handle
      .lock()
      .as_ref()
      .map(|handle| !handle.is_finished())
      .unwrap_or(false)
  }

  /// Sends a command and awaits the Coordinator's response.
  async fn request<T>(
    &self,
    make_cmd: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand,
  ) -> Result<T, SchedulerError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(make_cmd(responder))
      .await
      .map_err(|_| SchedulerError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| SchedulerError::ResponseFailed)
  }
}

impl Default for JobScheduler {
  fn default() -> Self {
    Self::new()
  }
}
