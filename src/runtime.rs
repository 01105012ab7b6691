//! Process-wide tokio runtime.
//!
//! The blocking facade in [`crate::client`] drives every async operation on
//! this multi-threaded runtime, and the pub/sub background worker runs on it
//! as a task.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::Runtime;

use crate::error::{Error, Result};

/// Worker thread override.
pub const THREADS_ENV: &str = "KVWIRE_RUNTIME_THREADS";

/// Global runtime, or the reason it could not be built.
static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

/// Get (or initialize) the global runtime.
///
/// Worker count defaults to the number of CPU cores and can be overridden
/// with `KVWIRE_RUNTIME_THREADS`.
pub fn get_runtime() -> Result<&'static Runtime> {
    RUNTIME
        .get_or_init(|| {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.enable_all();

            if let Some(n) = std::env::var(THREADS_ENV)
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
            {
                builder.worker_threads(n);
            }

            builder
                .thread_name("kvwire-rt")
                .build()
                .map_err(|e| format!("failed to create tokio runtime: {e}"))
        })
        .as_ref()
        .map_err(|e| Error::Usage(e.clone()))
}

/// Block the calling thread on `future`.
///
/// Must not be called from inside an async context; doing so is reported as
/// a usage error instead of deadlocking a worker.
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::Usage(
            "blocking call made from inside an async runtime; use the async API".into(),
        ));
    }
    Ok(get_runtime()?.block_on(future))
}

/// Spawn a task on the global runtime.
pub fn spawn<F>(future: F) -> Result<tokio::task::JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Ok(get_runtime()?.spawn(future))
}

// ── Tests ──────────────────────────────────────────────────────────
