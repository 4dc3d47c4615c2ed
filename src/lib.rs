//! Cadence: recurring maintenance jobs, idempotent session generation and
//! ordered shutdown for a long-running HTTP backend.
//!
//! # Components
//!
//! - [`JobScheduler`]: named recurring jobs on cron (or fixed-interval)
//!   schedules, evaluated in an IANA timezone. A job never runs concurrently
//!   with itself; a firing that arrives while the previous execution is still
//!   in flight is dropped and reported as [`JobEvent::Skipped`]. Task errors
//!   and panics are isolated to the firing that produced them.
//! - [`WindowGenerator`]: materializes every occurrence of the active session
//!   templates within `[today, today + weeks_ahead * 7 days)`. Each session is
//!   keyed by `(template_id, starts_at)`, so repeated or concurrent runs
//!   converge on the same rows.
//! - [`ShutdownCoordinator`]: on a signal, a supervised task fault, or an
//!   explicit request, runs the registered teardown steps strictly in order
//!   under one absolute deadline and reports an exit code.
//!
//! # Usage
//!
//! ```no_run
//! use cadence::{job_fn, JobScheduler, JobEvent};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = JobScheduler::new();
//!     let counter = Arc::new(AtomicUsize::new(0));
//!
//!     scheduler
//!         .register(
//!             "heartbeat",
//!             "*/5 * * * * *",
//!             "Europe/Rome",
//!             job_fn! {
//!                 { let counter = counter.clone(); }
//!                 {
//!                     counter.fetch_add(1, Ordering::SeqCst);
//!                     Ok(())
//!                 }
//!             },
//!         )
//!         .await?;
//!
//!     let mut events = scheduler.subscribe();
//!     scheduler.start("heartbeat").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let JobEvent::Completed { outcome, .. } = event {
//!             println!("heartbeat finished: {:?}", outcome);
//!             break;
//!         }
//!     }
//!
//!     scheduler.stop_all().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Job context (`job_context` feature)
//!
//! With the default `job_context` feature a running task can read its own
//! job name, run id and fire source through
//! [`try_get_current_job_context`] or the `job_context!()` macro.

pub mod clock;
pub(crate) mod command;
pub mod config;
pub(crate) mod coordinator;
pub mod error;
pub mod generation;
pub mod http;
pub mod job;
pub mod jobs;
mod macros;
pub mod metrics;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub(crate) mod worker;

// --- Public Re-exports ---

pub use scheduler::{JobScheduler, SchedulerBuilder};

pub use clock::{Clock, SystemClock, TokioClock};

pub use error::{ConfigError, GenerationError, SchedulerError, StorageError};

pub use job::{
  BoxedTask, CronSpec, ExecutionOutcome, FireSource, JobEvent, JobStatus, LastRun, NextFire,
  RunId, Schedule, SkipReason, TaskFuture, TriggerResult,
};
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

pub use generation::{GenerationReport, GenerationStats, GenerationWindow, WindowGenerator};

pub use shutdown::{
  ShutdownCause, ShutdownCoordinator, ShutdownPhase, ShutdownReport, StepOutcome, StepReport,
};

pub use metrics::{MetricsSnapshot, SchedulerMetrics};
