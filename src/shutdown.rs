//! Ordered, deadline-bounded process teardown.
//!
//! A [`ShutdownCoordinator`] is constructed at boot and handed to everything
//! that can end the process: the signal listener, supervised tasks, and the
//! HTTP layer. The first [`ShutdownCoordinator::trigger`] wins; later triggers
//! are logged and ignored. [`ShutdownCoordinator::run`] then executes the
//! registered steps strictly in order under one absolute deadline.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

// --- State ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
  Running,
  Draining,
  Stopped,
}

/// What initiated the shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
  /// An OS termination signal, by name (`SIGTERM`, `SIGINT`, ...).
  Signal(String),
  /// A supervised task panicked.
  Fault(String),
  /// A supervised task returned an error nobody else handles.
  Rejection(String),
  /// Programmatic request (tests, admin tooling).
  Requested(String),
}

impl fmt::Display for ShutdownCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ShutdownCause::Signal(name) => write!(f, "signal {}", name),
      ShutdownCause::Fault(msg) => write!(f, "fault: {}", msg),
      ShutdownCause::Rejection(msg) => write!(f, "rejection: {}", msg),
      ShutdownCause::Requested(reason) => write!(f, "requested: {}", reason),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
  Ok,
  /// The shared deadline expired while this step was running.
  TimedOut,
  Errored(String),
  /// A previous step exhausted the deadline.
  NotStarted,
}

#[derive(Debug, Clone)]
pub struct StepReport {
  pub name: String,
  pub outcome: StepOutcome,
  pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ShutdownReport {
  pub cause: ShutdownCause,
  pub steps: Vec<StepReport>,
  pub deadline_exceeded: bool,
  pub elapsed: Duration,
}

impl ShutdownReport {
  /// 0 if every step finished `Ok` before the deadline, 1 otherwise.
  pub fn exit_code(&self) -> i32 {
    let all_ok = self.steps.iter().all(|s| s.outcome == StepOutcome::Ok);
    if all_ok && !self.deadline_exceeded {
      0
    } else {
      1
    }
  }

  pub fn step(&self, name: &str) -> Option<&StepReport> {
    self.steps.iter().find(|s| s.name == name)
  }
}

// --- Coordinator ---

struct Inner {
  initiated: AtomicBool,
  phase_tx: watch::Sender<ShutdownPhase>,
  trigger: Mutex<Option<(ShutdownCause, Instant)>>,
  steps: Mutex<Vec<(String, StepFuture)>>,
  timeout: Duration,
  draining: CancellationToken,
}

/// Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct ShutdownCoordinator {
  inner: Arc<Inner>,
}

impl fmt::Debug for ShutdownCoordinator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShutdownCoordinator")
      .field("phase", &self.phase())
      .field("timeout", &self.inner.timeout)
      .finish_non_exhaustive()
  }
}

impl ShutdownCoordinator {
  pub fn new() -> Self {
    Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
  }

  /// `timeout` is measured from the moment of the trigger, not from `run()`.
  pub fn with_timeout(timeout: Duration) -> Self {
    let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
    Self {
      inner: Arc::new(Inner {
        initiated: AtomicBool::new(false),
        phase_tx,
        trigger: Mutex::new(None),
        steps: Mutex::new(Vec::new()),
        timeout,
        draining: CancellationToken::new(),
      }),
    }
  }

  pub fn timeout(&self) -> Duration {
    self.inner.timeout
  }

  pub fn phase(&self) -> ShutdownPhase {
    *self.inner.phase_tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
    self.inner.phase_tx.subscribe()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.inner.initiated.load(Ordering::SeqCst)
  }

  /// The cause of the shutdown, once triggered.
  pub fn cause(&self) -> Option<ShutdownCause> {
    self.inner.trigger.lock().as_ref().map(|(cause, _)| cause.clone())
  }

  /// Token cancelled the moment draining begins.
  pub fn draining_token(&self) -> CancellationToken {
    self.inner.draining.clone()
  }

  /// Appends a teardown step. Steps run in registration order.
  pub fn add_step<F>(&self, name: &str, step: F)
  where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    self.inner.steps.lock().push((name.to_string(), Box::pin(step)));
  }

  /// Initiates shutdown. Returns `true` only for the call that won; any
  /// later trigger is coalesced into the first.
  pub fn trigger(&self, cause: ShutdownCause) -> bool {
    if self
      .inner
      .initiated
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      let first = self.cause();
      warn!(
        %cause,
        first = ?first.map(|c| c.to_string()),
        "Shutdown already in progress, ignoring trigger."
      );
      return false;
    }

    info!(%cause, timeout_ms = self.inner.timeout.as_millis() as u64, "Initiating graceful shutdown.");
    *self.inner.trigger.lock() = Some((cause, Instant::now()));
    self.inner.phase_tx.send_replace(ShutdownPhase::Draining);
    self.inner.draining.cancel();
    true
  }

  /// Waits for a trigger, then runs every registered step in order.
  ///
  /// A step that errors (or panics) is recorded and the next step still
  /// runs. When the deadline expires the running step is abandoned as
  /// `TimedOut` and the remaining ones are reported as `NotStarted`. A step
  /// that returns only after the deadline also counts as `TimedOut`.
  pub async fn run(&self) -> ShutdownReport {
    self.inner.draining.cancelled().await;

    let (cause, triggered_at) = self
      .inner
      .trigger
      .lock()
      .clone()
      .unwrap_or_else(|| (ShutdownCause::Requested("unknown".to_string()), Instant::now()));
    let deadline = triggered_at + self.inner.timeout;
    let steps = std::mem::take(&mut *self.inner.steps.lock());

    let mut reports = Vec::with_capacity(steps.len());
    let mut deadline_exceeded = false;

    for (name, step) in steps {
      if deadline_exceeded {
        warn!(step = %name, "Shutdown step not started, deadline already exceeded.");
        reports.push(StepReport {
          name,
          outcome: StepOutcome::NotStarted,
          elapsed: Duration::ZERO,
        });
        continue;
      }

      info!(step = %name, "Running shutdown step.");
      let step_started = Instant::now();
      // Each step runs on its own task so a step that blocks its thread
      // cannot hold the deadline timer hostage.
      let mut handle = tokio::spawn(step);
      let mut outcome = match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(Ok(()))) => StepOutcome::Ok,
        Ok(Ok(Err(e))) => {
          error!(step = %name, error = %format!("{:#}", e), "Shutdown step failed.");
          StepOutcome::Errored(format!("{:#}", e))
        }
        Ok(Err(join_err)) => {
          let msg = if join_err.is_panic() {
            format!("panicked: {}", panic_message(join_err.into_panic()))
          } else {
            "cancelled".to_string()
          };
          error!(step = %name, error = %msg, "Shutdown step failed.");
          StepOutcome::Errored(msg)
        }
        Err(_) => {
          error!(step = %name, "Shutdown deadline exceeded during step.");
          handle.abort();
          StepOutcome::TimedOut
        }
      };
      // A step can also finish after the deadline without the timer ever
      // getting a chance to fire.
      if Instant::now() >= deadline {
        if outcome != StepOutcome::TimedOut {
          error!(step = %name, outcome = ?outcome, "Shutdown step finished after the deadline.");
          outcome = StepOutcome::TimedOut;
        }
        deadline_exceeded = true;
      }
      let elapsed = step_started.elapsed();
      info!(step = %name, outcome = ?outcome, duration_ms = elapsed.as_millis() as u64, "Shutdown step finished.");
      reports.push(StepReport {
        name,
        outcome,
        elapsed,
      });
    }

    self.inner.phase_tx.send_replace(ShutdownPhase::Stopped);
    let report = ShutdownReport {
      cause,
      steps: reports,
      deadline_exceeded,
      elapsed: triggered_at.elapsed(),
    };
    info!(
      exit_code = report.exit_code(),
      duration_ms = report.elapsed.as_millis() as u64,
      "Shutdown sequence finished."
    );
    report
  }

  /// Watches a critical task: a panic triggers a `Fault`, an `Err` return a
  /// `Rejection`. A clean return or an abort is only logged.
  pub fn supervise(&self, name: &str, handle: JoinHandle<anyhow::Result<()>>) -> JoinHandle<()> {
    let coordinator = self.clone();
    let name = name.to_string();
    tokio::spawn(async move {
      match handle.await {
        Ok(Ok(())) => info!(task = %name, "Supervised task exited."),
        Ok(Err(e)) => {
          error!(task = %name, error = %format!("{:#}", e), "Supervised task failed.");
          coordinator.trigger(ShutdownCause::Rejection(format!("{}: {:#}", name, e)));
        }
        Err(join_err) if join_err.is_panic() => {
          let msg = panic_message(join_err.into_panic());
          error!(task = %name, panic = %msg, "Supervised task panicked.");
          coordinator.trigger(ShutdownCause::Fault(format!("{}: {}", name, msg)));
        }
        Err(_) => warn!(task = %name, "Supervised task was cancelled."),
      }
    })
  }

  /// Spawns a listener that turns termination signals into triggers.
  pub fn listen_for_signals(&self) -> JoinHandle<()> {
    let coordinator = self.clone();
    tokio::spawn(async move { coordinator.signal_loop().await })
  }

  #[cfg(unix)]
  async fn signal_loop(&self) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint, mut sigquit) = match (
      signal(SignalKind::terminate()),
      signal(SignalKind::interrupt()),
      signal(SignalKind::quit()),
    ) {
      (Ok(term), Ok(int), Ok(quit)) => (term, int, quit),
      (term, int, quit) => {
        let e = term.err().or(int.err()).or(quit.err());
        error!(error = ?e, "Failed to install signal handlers.");
        return;
      }
    };

    loop {
      let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
        _ = sigquit.recv() => "SIGQUIT",
      };
      info!(signal = name, "Received termination signal.");
      self.trigger(ShutdownCause::Signal(name.to_string()));
    }
  }

  #[cfg(not(unix))]
  async fn signal_loop(&self) {
    loop {
      if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C.");
        return;
      }
      info!("Received Ctrl+C.");
      self.trigger(ShutdownCause::Signal("CTRL_C".to_string()));
    }
  }
}

impl Default for ShutdownCoordinator {
  fn default() -> Self {
    Self::new()
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}
