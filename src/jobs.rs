//! The recurring maintenance jobs registered by the server.

use crate::generation::WindowGenerator;
use crate::job::BoxedTask;
use crate::job_fn;
use crate::storage::Storage;

use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

pub const GENERATION_JOB: &str = "session-generation";
pub const CLEANUP_JOB: &str = "session-cleanup";

/// Generates the upcoming window on every firing.
///
/// A failed run is returned to the scheduler, which records it as the
/// firing's outcome. Nothing else happens: the next firing covers whatever
/// this one missed.
pub fn generation_task(generator: WindowGenerator, weeks_ahead: u32, skip_existing: bool) -> BoxedTask {
  job_fn! {
    {
      let generator = generator.clone();
    }
    {
      match generator.generate(weeks_ahead, skip_existing).await {
        Ok(report) => {
          info!(created = report.created, existing = report.existing, "Scheduled generation completed.");
          Ok(())
        }
        Err(e) => {
          warn!(created = e.created(), error = %e, "Scheduled generation failed, will retry on next firing.");
          Err(anyhow::Error::new(e).context("scheduled generation"))
        }
      }
    }
  }
}

/// Deletes sessions that ended more than `retention_days` ago.
pub fn cleanup_task(storage: Arc<dyn Storage>, retention_days: u32) -> BoxedTask {
  job_fn! {
    {
      let storage = storage.clone();
    }
    {
      let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
      let deleted = storage
        .delete_sessions_ended_before(cutoff)
        .await
        .context("deleting expired sessions")?;

      #[cfg(feature = "job_context")]
      let run_id = crate::job::context::try_get_current_job_context().map(|ctx| ctx.run_id);
      #[cfg(not(feature = "job_context"))]
      let run_id: Option<crate::job::RunId> = None;

      info!(deleted, %cutoff, ?run_id, "Expired sessions cleaned up.");
      Ok(())
    }
  }
}
