use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;

use crate::Result;

/// Spawns a named background task whose error is logged instead of
/// propagated.
///
/// The handle is pushed into `handles` when given so the owner can
/// abort or await it later.
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) -> Option<JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        match task_fn().await {
            Ok(()) => debug!(task = %name, "spawned task finished"),
            Err(e) => error!(task = %name, error = %e, "spawned task stopped with an error"),
        }
    });

    match handles {
        Some(h) => {
            h.push(handle);
            None
        }
        None => Some(handle),
    }
}
