//! tests/shutdown.rs
//! Ordered teardown under one absolute deadline.

mod common;

use common::setup_tracing;

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use cadence::storage::{Session, SessionKey, SqliteStorage, Storage, WriteMode, WriteOutcome};
use cadence::{ShutdownCause, ShutdownCoordinator, ShutdownPhase, StepOutcome};
use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn logging_step(
  log: &Log,
  name: &'static str,
  delay: StdDuration,
) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static {
  let log = log.clone();
  async move {
    tokio::time::sleep(delay).await;
    log.lock().unwrap().push(name);
    Ok(())
  }
}

#[tokio::test]
async fn test_steps_run_in_order_and_exit_zero() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::with_timeout(StdDuration::from_secs(2));
  let log: Log = Arc::new(Mutex::new(Vec::new()));

  // Earlier steps are slower; order must still hold.
  coordinator.add_step("http-listener", logging_step(&log, "http-listener", StdDuration::from_millis(60)));
  coordinator.add_step("job-scheduler", logging_step(&log, "job-scheduler", StdDuration::from_millis(30)));
  coordinator.add_step("storage", logging_step(&log, "storage", StdDuration::ZERO));

  let mut phases = coordinator.subscribe();
  assert_eq!(coordinator.phase(), ShutdownPhase::Running);
  assert!(coordinator.trigger(ShutdownCause::Signal("SIGTERM".to_string())));
  assert_eq!(coordinator.phase(), ShutdownPhase::Draining);
  assert_eq!(*phases.borrow_and_update(), ShutdownPhase::Draining);

  let report = coordinator.run().await;
  phases.changed().await.unwrap();
  assert_eq!(*phases.borrow(), ShutdownPhase::Stopped);
  assert_eq!(report.exit_code(), 0);
  assert!(!report.deadline_exceeded);
  assert_eq!(report.cause, ShutdownCause::Signal("SIGTERM".to_string()));
  assert_eq!(*log.lock().unwrap(), vec!["http-listener", "job-scheduler", "storage"]);
  let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
  assert_eq!(names, vec!["http-listener", "job-scheduler", "storage"]);
  assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::Ok));
  assert_eq!(coordinator.phase(), ShutdownPhase::Stopped);
}

#[tokio::test]
async fn test_stuck_step_hits_deadline() {
  setup_tracing();
  let deadline = StdDuration::from_millis(200);
  let coordinator = ShutdownCoordinator::with_timeout(deadline);
  let log: Log = Arc::new(Mutex::new(Vec::new()));

  coordinator.add_step("http-listener", logging_step(&log, "http-listener", StdDuration::ZERO));
  coordinator.add_step("job-scheduler", std::future::pending::<anyhow::Result<()>>());
  coordinator.add_step("storage", logging_step(&log, "storage", StdDuration::ZERO));

  let started = Instant::now();
  coordinator.trigger(ShutdownCause::Requested("test".to_string()));
  let report = coordinator.run().await;
  let elapsed = started.elapsed();

  assert_eq!(report.exit_code(), 1);
  assert!(report.deadline_exceeded);
  assert!(elapsed >= deadline, "run returned before the deadline: {elapsed:?}");
  assert!(elapsed < StdDuration::from_secs(2), "run overshot the deadline: {elapsed:?}");

  assert_eq!(report.step("http-listener").unwrap().outcome, StepOutcome::Ok);
  assert_eq!(report.step("job-scheduler").unwrap().outcome, StepOutcome::TimedOut);
  assert_eq!(report.step("storage").unwrap().outcome, StepOutcome::NotStarted);
  assert_eq!(*log.lock().unwrap(), vec!["http-listener"]);
}

#[tokio::test]
async fn test_deadline_is_measured_from_trigger() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::with_timeout(StdDuration::from_millis(200));
  let log: Log = Arc::new(Mutex::new(Vec::new()));
  coordinator.add_step("slow", logging_step(&log, "slow", StdDuration::from_millis(120)));

  coordinator.trigger(ShutdownCause::Requested("test".to_string()));
  // Part of the budget is spent before `run` starts.
  tokio::time::sleep(StdDuration::from_millis(120)).await;
  let report = coordinator.run().await;

  assert_eq!(report.step("slow").unwrap().outcome, StepOutcome::TimedOut);
  assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_errored_step_does_not_stop_later_steps() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::with_timeout(StdDuration::from_secs(2));
  let log: Log = Arc::new(Mutex::new(Vec::new()));

  coordinator.add_step("http-listener", logging_step(&log, "http-listener", StdDuration::ZERO));
  coordinator.add_step("job-scheduler", async { Err::<(), _>(anyhow::anyhow!("scheduler unreachable")) });
  coordinator.add_step("storage", logging_step(&log, "storage", StdDuration::ZERO));

  coordinator.trigger(ShutdownCause::Requested("test".to_string()));
  let report = coordinator.run().await;

  assert_eq!(report.exit_code(), 1);
  assert!(!report.deadline_exceeded);
  assert_eq!(
    report.step("job-scheduler").unwrap().outcome,
    StepOutcome::Errored("scheduler unreachable".to_string())
  );
  assert_eq!(report.step("storage").unwrap().outcome, StepOutcome::Ok);
  assert_eq!(*log.lock().unwrap(), vec!["http-listener", "storage"]);
}

#[tokio::test]
async fn test_later_triggers_are_coalesced() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::new();
  assert_eq!(coordinator.timeout(), cadence::shutdown::DEFAULT_SHUTDOWN_TIMEOUT);
  let token = coordinator.draining_token();
  assert!(!token.is_cancelled());

  assert!(coordinator.trigger(ShutdownCause::Signal("SIGINT".to_string())));
  assert!(!coordinator.trigger(ShutdownCause::Signal("SIGTERM".to_string())));
  assert!(!coordinator.trigger(ShutdownCause::Fault("late".to_string())));

  assert!(token.is_cancelled());
  assert!(coordinator.is_shutting_down());
  assert_eq!(coordinator.cause(), Some(ShutdownCause::Signal("SIGINT".to_string())));
}

#[tokio::test]
async fn test_run_waits_for_trigger() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::with_timeout(StdDuration::from_secs(1));
  let runner = {
    let c = coordinator.clone();
    tokio::spawn(async move { c.run().await })
  };

  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert!(!runner.is_finished());

  let clone = coordinator.clone();
  std::thread::spawn(move || clone.trigger(ShutdownCause::Requested("from another thread".to_string())))
    .join()
    .unwrap();

  let report = tokio::time::timeout(StdDuration::from_secs(1), runner)
    .await
    .expect("run should finish after trigger")
    .unwrap();
  assert_eq!(report.exit_code(), 0);
  assert!(report.steps.is_empty());
}

#[tokio::test]
async fn test_supervised_panic_triggers_fault() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::new();
  let task = tokio::spawn(async {
    tokio::task::yield_now().await;
    if true {
      panic!("listener exploded");
    }
    Ok::<(), anyhow::Error>(())
  });

  coordinator.supervise("http-server", task).await.unwrap();
  match coordinator.cause() {
    Some(ShutdownCause::Fault(msg)) => {
      assert!(msg.contains("http-server"));
      assert!(msg.contains("listener exploded"));
    }
    other => panic!("expected Fault, got {other:?}"),
  }
}

#[tokio::test]
async fn test_supervised_error_triggers_rejection() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::new();
  let task = tokio::spawn(async { Err::<(), _>(anyhow::anyhow!("bind lost")) });

  coordinator.supervise("http-server", task).await.unwrap();
  assert!(matches!(
    coordinator.cause(),
    Some(ShutdownCause::Rejection(msg)) if msg.contains("bind lost")
  ));

  // A clean exit triggers nothing.
  let quiet = ShutdownCoordinator::new();
  quiet
    .supervise("worker", tokio::spawn(async { Ok::<(), anyhow::Error>(()) }))
    .await
    .unwrap();
  assert!(!quiet.is_shutting_down());
}

#[tokio::test]
async fn test_step_returning_ok_after_deadline_counts_as_timed_out() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::with_timeout(StdDuration::from_millis(100));
  let log: Log = Arc::new(Mutex::new(Vec::new()));

  // Holds the only runtime thread well past the deadline, then succeeds.
  coordinator.add_step("job-scheduler", async {
    std::thread::sleep(StdDuration::from_millis(300));
    Ok::<(), anyhow::Error>(())
  });
  coordinator.add_step("storage", logging_step(&log, "storage", StdDuration::ZERO));

  coordinator.trigger(ShutdownCause::Requested("test".to_string()));
  let report = coordinator.run().await;

  assert!(report.deadline_exceeded);
  assert_eq!(report.exit_code(), 1);
  assert_eq!(report.step("job-scheduler").unwrap().outcome, StepOutcome::TimedOut);
  assert_eq!(report.step("storage").unwrap().outcome, StepOutcome::NotStarted);
  assert!(log.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_step_does_not_hold_the_deadline() {
  setup_tracing();
  let deadline = StdDuration::from_millis(150);
  let coordinator = ShutdownCoordinator::with_timeout(deadline);
  coordinator.add_step("storage", async {
    std::thread::sleep(StdDuration::from_secs(1));
    Ok::<(), anyhow::Error>(())
  });

  let started = Instant::now();
  coordinator.trigger(ShutdownCause::Requested("test".to_string()));
  let report = coordinator.run().await;
  let elapsed = started.elapsed();

  assert!(elapsed >= deadline, "run returned before the deadline: {elapsed:?}");
  assert!(elapsed < StdDuration::from_millis(800), "run waited for the blocked step: {elapsed:?}");
  assert_eq!(report.step("storage").unwrap().outcome, StepOutcome::TimedOut);
  assert_eq!(report.exit_code(), 1);
}

async fn exploding_step() -> anyhow::Result<()> {
  panic!("listener exploded")
}

#[tokio::test]
async fn test_panicking_step_is_reported_as_errored() {
  setup_tracing();
  let coordinator = ShutdownCoordinator::with_timeout(StdDuration::from_secs(2));
  let log: Log = Arc::new(Mutex::new(Vec::new()));
  coordinator.add_step("http-listener", exploding_step());
  coordinator.add_step("storage", logging_step(&log, "storage", StdDuration::ZERO));

  coordinator.trigger(ShutdownCause::Requested("test".to_string()));
  let report = coordinator.run().await;

  match &report.step("http-listener").unwrap().outcome {
    StepOutcome::Errored(msg) => assert!(msg.contains("listener exploded"), "unexpected message: {msg}"),
    other => panic!("expected an errored step, got {other:?}"),
  }
  assert_eq!(report.step("storage").unwrap().outcome, StepOutcome::Ok);
  assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_storage_step_stuck_behind_a_locked_database_times_out() {
  setup_tracing();
  let path = std::env::temp_dir().join(format!("cadence-shutdown-{}.db", Uuid::new_v4()));
  let storage = Arc::new(SqliteStorage::connect(&path).unwrap());

  // Another process holds the write lock, so the next write sits in
  // SQLite's busy timeout.
  let locker = rusqlite::Connection::open(&path).unwrap();
  locker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

  let now = Utc::now();
  let session = Session::new(SessionKey::new(1, now), 60, now);
  let writer = {
    let storage = storage.clone();
    tokio::spawn(async move { storage.write_session(&session, WriteMode::InsertIfAbsent).await })
  };
  tokio::time::sleep(StdDuration::from_millis(100)).await;

  let deadline = StdDuration::from_millis(300);
  let coordinator = ShutdownCoordinator::with_timeout(deadline);
  {
    let storage = storage.clone();
    coordinator.add_step("storage", async move {
      storage.disconnect().await?;
      Ok::<(), anyhow::Error>(())
    });
  }

  let started = Instant::now();
  coordinator.trigger(ShutdownCause::Signal("SIGTERM".to_string()));
  let report = coordinator.run().await;
  let elapsed = started.elapsed();

  assert!(elapsed < StdDuration::from_secs(2), "shutdown overran its deadline: {elapsed:?}");
  assert_eq!(report.step("storage").unwrap().outcome, StepOutcome::TimedOut);
  assert!(report.deadline_exceeded);
  assert_eq!(report.exit_code(), 1);

  // Releasing the lock lets the pending write land.
  locker.execute_batch("COMMIT;").unwrap();
  assert_eq!(writer.await.unwrap().unwrap(), WriteOutcome::Inserted);
  drop(locker);
  let _ = std::fs::remove_file(&path);
}
