/// Macro to simplify creating a `BoxedTask` compatible closure.
///
/// Takes an optional synchronous setup block and a mandatory async logic block.
/// Handles the necessary boxing (`Box::new`, `Box::pin`). The logic block must
/// evaluate to `anyhow::Result<()>`.
///
/// # Usage
///
/// ```ignore
/// # use cadence::job_fn;
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// # let counter = Arc::new(AtomicUsize::new(0));
/// // With setup block (runs on every firing, before the future is created):
/// let task = job_fn! {
///     {
///         let job_counter = counter.clone();
///     }
///     {
///         job_counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// };
///
/// // Without setup block:
/// let noop = job_fn! {
///     {
///         tokio::task::yield_now().await;
///         Ok(())
///     }
/// };
/// ```
#[macro_export]
macro_rules! job_fn {
    (
        { $($setup_stmts:stmt);* $(;)? }
        $main_block:block
    ) => {
        Box::new(move || {
            $($setup_stmts;)*

            let fut = async move {
                let result: ::anyhow::Result<()> = $main_block;
                result
            };

            Box::pin(fut) as $crate::job::TaskFuture
        }) as $crate::job::BoxedTask
    };

    (
        $main_block:block
    ) => {
        Box::new(move || {
            let fut = async move {
                let result: ::anyhow::Result<()> = $main_block;
                result
            };

            Box::pin(fut) as $crate::job::TaskFuture
        }) as $crate::job::BoxedTask
    };
}
