//! One-shot startup watchdog.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Fires once after a deadline unless cancelled first.
///
/// Dropping the watchdog cancels it.
pub struct Watchdog {
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Arm a watchdog that runs `on_fire` after `deadline`.
    pub fn arm<F, Fut>(deadline: Duration, on_fire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("Watchdog armed ({:?})", deadline);
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            warn!("Watchdog fired after {:?}", deadline);
            on_fire().await;
        });

        Self { task: Some(task) }
    }

    /// Disarm. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("Watchdog cancelled");
            }
            task.abort();
        }
    }

    /// Forget the task without aborting it.
    ///
    /// Used from inside the fire callback, where aborting would cancel the
    /// callback itself at its next await.
    pub fn detach(mut self) {
        self.task.take();
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
