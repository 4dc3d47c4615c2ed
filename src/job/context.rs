use super::{FireSource, RunId};

/// Contextual information available to a running job execution via task-locals.
/// Accessible within a `BoxedTask` using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug)]
pub struct JobContext {
  /// Name of the job being executed.
  pub job_name: String,
  /// The unique ID of this specific execution.
  pub run_id: RunId,
  /// Whether the execution was started by the timer or a manual trigger.
  pub source: FireSource,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a job's execution scope.
    /// Set by the scheduler's execution runner if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing job.
///
/// Returns `None` if called outside an execution started by the scheduler.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// scheduler-managed execution.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
