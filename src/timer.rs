//! Cancellable one-shot deadlines on the tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};

/// A callback scheduled to run once at a fixed instant.
///
/// Cancelling is idempotent, and dropping the handle cancels it.
#[derive(Debug)]
pub struct Deadline {
    task: AbortHandle,
}

impl Deadline {
    pub fn arm<F>(runtime: &Handle, after: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let at = Instant::now() + after;
        let task = runtime.spawn(async move {
            sleep_until(at).await;
            on_expire();
        });
        Self {
            task: task.abort_handle(),
        }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.task.abort();
    }
}
