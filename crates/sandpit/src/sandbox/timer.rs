//! Resettable one-shot idle timer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// One-shot timer that runs an action after a period without [`reset`](Self::reset)
///
/// The timer is armed on creation. Each reset pushes the expiry back by the
/// full duration; after firing, the timer stays idle until the next reset.
/// A reset that races with an expiry is consumed before the timer re-arms,
/// so the action runs once per expiry that no reset superseded.
///
/// The action runs on its own task and must not assume it is called from
/// the task that owns the timer. Dropping the timer cancels it.
#[derive(Debug)]
pub struct IdleTimer {
    rearm: Arc<Notify>,
    task: JoinHandle<()>,
}

impl IdleTimer {
    /// Create and arm a timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F>(duration: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let rearm = Arc::new(Notify::new());
        let action = Arc::new(action);
        let task = tokio::spawn(watch(duration, Arc::clone(&rearm), action));

        Self {
            rearm,
            task,
        }
    }

    /// Re-arm the timer, superseding any pending expiry
    pub fn reset(&self) {
        self.rearm.notify_one();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch<F>(duration: Duration, rearm: Arc<Notify>, action: Arc<F>)
where
    F: Fn() + Send + Sync + 'static,
{
    let mut deadline = Some(Instant::now() + duration);

    loop {
        match deadline {
            Some(at) => {
                tokio::select! {
                    // Pending resets win over an expiry observed in the same poll.
                    biased;
                    () = rearm.notified() => {
                        deadline = Some(Instant::now() + duration);
                    }
                    () = sleep_until(at) => {
                        trace!(?duration, "idle timer fired");
                        deadline = None;
                        let action = Arc::clone(&action);
                        tokio::spawn(async move { action() });
                    }
                }
            }
            None => {
                rearm.notified().await;
                deadline = Some(Instant::now() + duration);
            }
        }
    }
}
