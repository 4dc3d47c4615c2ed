//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cadence::storage::{
  MemoryStorage, Session, SessionCounts, SessionKey, SessionTemplate, Storage, WriteMode,
  WriteOutcome,
};
use cadence::{job_fn, BoxedTask, JobEvent, StorageError};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use tokio::sync::{broadcast, Notify};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .try_init();
}

// --- Job Tasks ---

// Increments a counter, optionally delays, and fails on request.
pub fn job_counter(counter: Arc<AtomicUsize>, delay: StdDuration, succeeds: bool) -> BoxedTask {
  job_fn! {
    {
      let ctr = counter.clone();
    }
    {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(count, succeeds, "Counter job executing");
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      if succeeds {
        Ok(())
      } else {
        Err(anyhow::anyhow!("counter job failed on run {}", count))
      }
    }
  }
}

// Signals `started`, then blocks until `release` is notified.
pub fn job_blocking(counter: Arc<AtomicUsize>, started: Arc<Notify>, release: Arc<Notify>) -> BoxedTask {
  job_fn! {
    {
      let ctr = counter.clone();
      let started = started.clone();
      let release = release.clone();
    }
    {
      ctr.fetch_add(1, Ordering::SeqCst);
      started.notify_one();
      release.notified().await;
      Ok(())
    }
  }
}

pub fn job_panic() -> BoxedTask {
  job_fn! {
    {
      tokio::task::yield_now().await;
      panic!("Job forced panic!")
    }
  }
}

// Tracks the highest number of simultaneously running executions.
pub fn job_concurrency_tracker(
  active: Arc<AtomicUsize>,
  max_observed: Arc<AtomicUsize>,
  delay: StdDuration,
) -> BoxedTask {
  job_fn! {
    {
      let active = active.clone();
      let max_obs = max_observed.clone();
    }
    {
      let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
      max_obs.fetch_max(now_active, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      active.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    }
  }
}

/// Receives events until one matches `pred`, or panics after `timeout`.
pub async fn wait_for_event<F>(
  rx: &mut broadcast::Receiver<JobEvent>,
  timeout: StdDuration,
  pred: F,
) -> JobEvent
where
  F: Fn(&JobEvent) -> bool,
{
  tokio::time::timeout(timeout, async {
    loop {
      match rx.recv().await {
        Ok(event) if pred(&event) => return event,
        Ok(_) => continue,
        Err(broadcast::error::RecvError::Lagged(n)) => {
          tracing::warn!(n, "Test receiver lagged");
          continue;
        }
        Err(e) => panic!("event channel closed: {e}"),
      }
    }
  })
  .await
  .expect("timed out waiting for job event")
}

// --- Storage Helpers ---

pub fn weekday_template(id: i64, weekdays: Vec<Weekday>, hour: u32) -> SessionTemplate {
  SessionTemplate {
    id,
    name: format!("template-{id}"),
    weekdays,
    start_time: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
    duration_minutes: 60,
    timezone: "UTC".to_string(),
    active: true,
  }
}

pub fn daily_template(id: i64, hour: u32) -> SessionTemplate {
  SessionTemplate::daily(
    id,
    &format!("daily-{id}"),
    NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
    60,
  )
}

/// In-memory storage whose writes fail for one template while `failing` is set.
pub struct FailingStorage {
  pub inner: MemoryStorage,
  pub fail_template: i64,
  pub failing: AtomicBool,
  pub write_attempts: AtomicUsize,
}

impl FailingStorage {
  pub fn new(inner: MemoryStorage, fail_template: i64) -> Self {
    Self {
      inner,
      fail_template,
      failing: AtomicBool::new(true),
      write_attempts: AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl Storage for FailingStorage {
  async fn active_templates(&self) -> Result<Vec<SessionTemplate>, StorageError> {
    self.inner.active_templates().await
  }

  async fn upsert_template(&self, template: &SessionTemplate) -> Result<(), StorageError> {
    self.inner.upsert_template(template).await
  }

  async fn existing_keys(&self, keys: &[SessionKey]) -> Result<HashSet<SessionKey>, StorageError> {
    self.inner.existing_keys(keys).await
  }

  async fn write_session(
    &self,
    session: &Session,
    mode: WriteMode,
  ) -> Result<WriteOutcome, StorageError> {
    self.write_attempts.fetch_add(1, Ordering::SeqCst);
    if self.failing.load(Ordering::SeqCst) && session.key.template_id == self.fail_template {
      return Err(StorageError::Unavailable("injected write failure".to_string()));
    }
    self.inner.write_session(session, mode).await
  }

  async fn delete_sessions_ended_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
    self.inner.delete_sessions_ended_before(cutoff).await
  }

  async fn session_counts(
    &self,
    now: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
  ) -> Result<SessionCounts, StorageError> {
    self.inner.session_counts(now, horizon_end).await
  }

  async fn disconnect(&self) -> Result<(), StorageError> {
    self.inner.disconnect().await
  }
}
