use crate::clock::Clock;
use crate::command::{CoordinatorCommand, ExecutionReport};
use crate::error::SchedulerError;
use crate::job::{
  FireSource, JobDefinition, JobEvent, JobStatus, LastRun, RunId, SkipReason, TriggerResult,
};
use crate::metrics::SchedulerMetrics;
use crate::worker::Execution;

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Registry entry for a single job. Only the Coordinator task touches these,
/// which is what makes the `running` flag a reliable exclusivity guard.
#[derive(Debug)]
struct JobEntry {
  definition: JobDefinition,
  active: bool,
  next_fire: Option<DateTime<Utc>>,
  /// `Some` while an execution is in flight.
  running: Option<RunId>,
  last_run: Option<LastRun>,
}

impl JobEntry {
  fn status(&self) -> JobStatus {
    JobStatus {
      name: self.definition.name.clone(),
      schedule: self.definition.schedule_description.clone(),
      active: self.active,
      next_fire_time: self.next_fire,
      running: self.running.is_some(),
      last_run: self.last_run.clone(),
    }
  }
}

/// Channels and shared handles the Coordinator is constructed with.
pub(crate) struct CoordinatorState {
  pub cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  pub events_tx: broadcast::Sender<JobEvent>,
  pub running_tx: watch::Sender<usize>,
  pub metrics: SchedulerMetrics,
  pub clock: Arc<dyn Clock>,
}

/// The central Coordinator task for the scheduler.
///
/// Owns the job registry and a handle-based priority queue holding at most one
/// pending fire time per active job. Commands from `JobScheduler` handles,
/// execution reports and timer wakeups are all processed on this single task.
pub(crate) struct Coordinator {
  jobs: HashMap<String, JobEntry>,
  timers: PriorityQueue<String, Reverse<DateTime<Utc>>>,
  cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  report_tx: mpsc::UnboundedSender<ExecutionReport>,
  report_rx: mpsc::UnboundedReceiver<ExecutionReport>,
  events_tx: broadcast::Sender<JobEvent>,
  running_tx: watch::Sender<usize>,
  metrics: SchedulerMetrics,
  clock: Arc<dyn Clock>,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    let (report_tx, report_rx) = mpsc::unbounded_channel();
    Self {
      jobs: HashMap::new(),
      timers: PriorityQueue::new(),
      cmd_rx: state.cmd_rx,
      report_tx,
      report_rx,
      events_tx: state.events_tx,
      running_tx: state.running_tx,
      metrics: state.metrics,
      clock: state.clock,
    }
  }

  /// Runs the main event loop until a `Shutdown` command arrives or every
  /// `JobScheduler` handle has been dropped.
  pub async fn run(&mut self) {
    info!("Coordinator started.");

    loop {
      let sleep_duration = self.calculate_sleep();

      tokio::select! {
          biased;

          // --- Command Processing ---
          maybe_cmd = self.cmd_rx.recv() => {
              match maybe_cmd {
                  Some(CoordinatorCommand::Shutdown { responder }) => {
                      let _ = responder.send(self.shutdown());
                      break;
                  }
                  Some(cmd) => self.handle_command(cmd),
                  None => {
                      info!("All scheduler handles dropped. Coordinator exiting.");
                      break;
                  }
              }
          },

          // --- Execution Reports ---
          Some(report) = self.report_rx.recv() => {
              self.handle_report(report);
          },

          // --- Timer Wakeup ---
          _ = sleep(sleep_duration.unwrap_or_default()), if sleep_duration.is_some() => {
              trace!("Timer fired.");
              self.fire_due_jobs();
          }
      }
    }

    let in_flight = self.running_count();
    if in_flight > 0 {
      warn!(in_flight, "Coordinator exiting with executions still in flight; their outcomes will not be recorded.");
    }
  }

  /// Duration until the earliest queued fire time, `None` if no timer is queued.
  fn calculate_sleep(&self) -> Option<Duration> {
    let (_, Reverse(next_fire)) = self.timers.peek()?;
    let now = self.clock.now();
    if *next_fire <= now {
      return Some(Duration::ZERO);
    }
    match (*next_fire - now).to_std() {
      // Minimum sleep prevents hot loops on tiny durations.
      Ok(duration) => Some(duration.max(Duration::from_millis(1))),
      Err(e) => {
        warn!(error = %e, "Failed to convert chrono duration. Minimal sleep.");
        Some(Duration::from_millis(10))
      }
    }
  }

  fn handle_command(&mut self, cmd: CoordinatorCommand) {
    match cmd {
      CoordinatorCommand::Register {
        definition,
        responder,
      } => {
        let _ = responder.send(self.register(definition));
      }
      CoordinatorCommand::Start { name, responder } => {
        let _ = responder.send(self.start(&name));
      }
      CoordinatorCommand::Stop { name, responder } => {
        let _ = responder.send(self.stop(&name));
      }
      CoordinatorCommand::StopAll { responder } => {
        let _ = responder.send(self.stop_all());
      }
      CoordinatorCommand::TriggerNow { name, responder } => {
        let result = if self.jobs.contains_key(&name) {
          self
            .metrics
            .manual_triggers
            .fetch_add(1, AtomicOrdering::Relaxed);
          Ok(self.fire(&name, FireSource::Manual))
        } else {
          Err(SchedulerError::UnknownJob(name))
        };
        let _ = responder.send(result);
      }
      CoordinatorCommand::GetStatus { name, responder } => {
        let result = self
          .jobs
          .get(&name)
          .map(JobEntry::status)
          .ok_or(SchedulerError::UnknownJob(name));
        let _ = responder.send(result);
      }
      CoordinatorCommand::ListJobs { responder } => {
        let mut statuses: Vec<JobStatus> = self.jobs.values().map(JobEntry::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        let _ = responder.send(statuses);
      }
      CoordinatorCommand::GetMetricsSnapshot { responder } => {
        let _ = responder.send(self.metrics.snapshot());
      }
      CoordinatorCommand::Shutdown { responder } => {
        // Intercepted by the run loop, which must also exit.
        let _ = responder.send(self.shutdown());
      }
    }
  }

  fn register(&mut self, definition: JobDefinition) -> Result<(), SchedulerError> {
    if self.jobs.contains_key(&definition.name) {
      warn!(job = %definition.name, "Rejected duplicate job registration.");
      return Err(SchedulerError::DuplicateJob(definition.name));
    }
    info!(job = %definition.name, schedule = %definition.schedule_description, "Registered job.");
    self.jobs.insert(
      definition.name.clone(),
      JobEntry {
        definition,
        active: false,
        next_fire: None,
        running: None,
        last_run: None,
      },
    );
    Ok(())
  }

  fn start(&mut self, name: &str) -> Result<(), SchedulerError> {
    let entry = self
      .jobs
      .get_mut(name)
      .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
    if entry.active {
      debug!(job = %name, "Start requested for already active job; ignoring.");
      return Ok(());
    }

    let next_fire = entry
      .definition
      .schedule
      .next_fire_after(self.clock.now())
      .ok_or_else(|| SchedulerError::InvalidSchedule {
        name: name.to_string(),
        reason: "schedule has no upcoming fire time".to_string(),
      })?;

    entry.active = true;
    entry.next_fire = Some(next_fire);
    self.timers.push(name.to_string(), Reverse(next_fire));
    info!(job = %name, next_fire = %next_fire, "Job timer activated.");
    self.update_active_gauge();
    Ok(())
  }

  fn stop(&mut self, name: &str) -> Result<(), SchedulerError> {
    let entry = self
      .jobs
      .get_mut(name)
      .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
    if !entry.active {
      debug!(job = %name, "Stop requested for inactive job; ignoring.");
      return Ok(());
    }
    entry.active = false;
    entry.next_fire = None;
    self.timers.remove(name);
    info!(job = %name, running = entry.running.is_some(), "Job timer deactivated.");
    self.update_active_gauge();
    Ok(())
  }

  /// Deactivates every timer and returns the number of executions still in flight.
  fn stop_all(&mut self) -> usize {
    let mut stopped = 0;
    for entry in self.jobs.values_mut() {
      if entry.active {
        entry.active = false;
        entry.next_fire = None;
        stopped += 1;
      }
    }
    self.timers.clear();
    self.update_active_gauge();
    let in_flight = self.running_count();
    info!(stopped, in_flight, "All job timers deactivated.");
    in_flight
  }

  /// Stops every timer and unregisters every job. Executions in flight keep
  /// running but their outcomes are no longer recorded.
  fn shutdown(&mut self) -> usize {
    let in_flight = self.stop_all();
    let unregistered = self.jobs.len();
    self.jobs.clear();
    self.update_active_gauge();
    if in_flight > 0 {
      warn!(in_flight, "Scheduler shut down with executions still in flight.");
    }
    info!(unregistered, "Scheduler shut down; all jobs unregistered.");
    in_flight
  }

  /// Pops every timer that is due, requeues its next fire time and fires it.
  fn fire_due_jobs(&mut self) {
    let now = self.clock.now();
    loop {
      let due = matches!(self.timers.peek(), Some((_, Reverse(fire_time))) if *fire_time <= now);
      if !due {
        break;
      }
      let Some((name, Reverse(fire_time))) = self.timers.pop() else {
        break;
      };

      let Some(entry) = self.jobs.get_mut(&name) else {
        warn!(job = %name, "Timer popped for unknown job; discarding.");
        continue;
      };
      if !entry.active {
        trace!(job = %name, "Timer popped for inactive job; discarding.");
        continue;
      }

      // Queue the next firing before running this one, so a slow execution
      // never delays the timer.
      match entry.definition.schedule.next_fire_after(now) {
        Some(next_fire) => {
          entry.next_fire = Some(next_fire);
          self.timers.push(name.clone(), Reverse(next_fire));
        }
        None => {
          warn!(job = %name, "Schedule has no further fire times; deactivating job.");
          entry.active = false;
          entry.next_fire = None;
        }
      }

      self
        .metrics
        .firings_total
        .fetch_add(1, AtomicOrdering::Relaxed);
      trace!(job = %name, scheduled_for = %fire_time, "Timer firing.");
      self.fire(&name, FireSource::Timer);
    }
    self.update_active_gauge();
  }

  /// Starts an execution unless one is already in flight, in which case the
  /// firing is dropped (never queued, never run in parallel).
  fn fire(&mut self, name: &str, source: FireSource) -> TriggerResult {
    let Some(entry) = self.jobs.get_mut(name) else {
      // Callers check membership first.
      return TriggerResult::Skipped {
        reason: SkipReason::AlreadyRunning,
      };
    };

    if let Some(running_id) = entry.running {
      self
        .metrics
        .firings_skipped_running
        .fetch_add(1, AtomicOrdering::Relaxed);
      info!(job = %name, ?source, %running_id, "Skipped firing: job is already running.");
      let _ = self.events_tx.send(JobEvent::Skipped {
        job: name.to_string(),
        source,
        reason: SkipReason::AlreadyRunning,
      });
      return TriggerResult::Skipped {
        reason: SkipReason::AlreadyRunning,
      };
    }

    let run_id = Uuid::new_v4();
    entry.running = Some(run_id);
    let execution = Execution {
      job: name.to_string(),
      run_id,
      source,
      task: entry.definition.task.clone(),
      metrics: self.metrics.clone(),
      report_tx: self.report_tx.clone(),
      clock: self.clock.clone(),
    };
    let _ = self.events_tx.send(JobEvent::Started {
      job: name.to_string(),
      run_id,
      source,
    });
    execution.spawn();
    self.update_running_gauge();
    TriggerResult::Started { run_id }
  }

  /// Moves a job back to `Idle` once its execution has reported.
  fn handle_report(&mut self, report: ExecutionReport) {
    match self.jobs.get_mut(&report.job) {
      Some(entry) if entry.running == Some(report.run_id) => {
        entry.running = None;
        entry.last_run = Some(LastRun {
          run_id: report.run_id,
          started_at: report.started_at,
          duration_ms: report.duration.as_millis() as u64,
          outcome: report.outcome.clone(),
        });
      }
      _ => {
        warn!(job = %report.job, run_id = %report.run_id, "Received report for unknown execution.");
        return;
      }
    }

    debug!(
      job = %report.job,
      run_id = %report.run_id,
      source = ?report.source,
      duration_ms = report.duration.as_millis() as u64,
      outcome = report.outcome.label(),
      "Job returned to idle."
    );
    let _ = self.events_tx.send(JobEvent::Completed {
      job: report.job,
      run_id: report.run_id,
      duration: report.duration,
      outcome: report.outcome,
    });
    self.update_running_gauge();
  }

  fn running_count(&self) -> usize {
    self.jobs.values().filter(|e| e.running.is_some()).count()
  }

  fn update_running_gauge(&self) {
    let running = self.running_count();
    self
      .metrics
      .executions_running_current
      .store(running, AtomicOrdering::Relaxed);
    self.running_tx.send_replace(running);
  }

  fn update_active_gauge(&self) {
    let active = self.jobs.values().filter(|e| e.active).count();
    self
      .metrics
      .jobs_active_current
      .store(active, AtomicOrdering::Relaxed);
  }
}
