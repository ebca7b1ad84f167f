//! Fault containment helpers.
//!
//! A panic anywhere inside a call must become an `Internal` error for that
//! call and nothing else. These helpers run work where a panic can be
//! observed and converted.

use std::any::Any;
use std::future::Future;

use tablet_common::error::{TabletError, TabletResult};
use tokio::task::AbortHandle;
use tracing::error;

/// Extracts a printable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs `fut` on its own task and converts a panic into `Internal`.
///
/// Dropping the returned future aborts the task.
///
/// # Errors
///
/// Returns the future's own error, or `Internal` if it panicked.
pub async fn contain<F, T>(fut: F) -> TabletResult<T>
where
    F: Future<Output = TabletResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(fut);
    let _abort = AbortOnDrop(handle.abort_handle());
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(&*e.into_panic());
            error!(%message, "caught panic in call");
            Err(TabletError::caught_panic(message))
        }
        Err(_) => Err(TabletError::cancelled("call was aborted")),
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
