//! Cancellable, reschedulable timeout tasks.
//!
//! Each live session owns a [`TimeoutTask`] that is re-armed on every state
//! transition. If nothing happens before it fires, the scheduled future
//! runs (normally a watchdog pass over the session). Arming again cancels
//! the previous schedule, so at most one timer per task is ever pending.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Boxed future run when a timeout fires.
pub type TimeoutFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A single pending timeout, cancelled on re-arm and on drop.
#[derive(Debug, Default)]
pub struct TimeoutTask {
    handle: Option<AbortHandle>,
}

impl TimeoutTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_timeout` after `delay`, replacing any pending schedule.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&mut self, delay: Duration, on_timeout: TimeoutFuture) {
        self.cancel();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_timeout.await;
        });
        self.handle = Some(task.abort_handle());
    }

    /// Cancel the pending schedule, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the pending schedule without cancelling it.
    ///
    /// Called by the scheduled future once it runs, so re-arming from
    /// inside it does not abort itself.
    pub fn detach(&mut self) {
        self.handle = None;
    }

    /// Whether a schedule is pending.
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimeoutTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter_future(counter: &Arc<AtomicU32>) -> TimeoutFuture {
        let counter = Arc::clone(counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut task = TimeoutTask::new();
        task.arm(Duration::from_secs(2), counter_future(&fired));
        assert!(task.is_armed());

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut task = TimeoutTask::new();
        task.arm(Duration::from_secs(1), counter_future(&fired));
        task.arm(Duration::from_secs(3), counter_future(&fired));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicU32::new(0));
        {
            let mut task = TimeoutTask::new();
            task.arm(Duration::from_secs(1), counter_future(&fired));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
