//! Single-slot delayed task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;

/// A timer holding at most one pending task.
///
/// Arming the timer cancels whatever wait was pending, so a slot can never
/// leak timers or fire twice. Once the delay elapses the task is spawned on
/// its own; re-arming or cancelling afterwards does not interrupt a task
/// that is already running.
pub struct SingleSlotTimer {
    label: String,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl SingleSlotTimer {
    pub fn new(label: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            label: label.into(),
            clock,
            slot: Mutex::new(None),
        }
    }

    /// Schedule `task` to run after `delay`, replacing any pending task.
    pub fn arm<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let clock = Arc::clone(&self.clock);
        let label = self.label.clone();
        let handle = tokio::spawn(async move {
            clock.sleep(delay).await;
            debug!("Timer '{}' fired after {:?}", label, delay);
            tokio::spawn(task);
        });

        if let Some(previous) = self.slot.lock().replace(handle) {
            if !previous.is_finished() {
                debug!("Timer '{}' re-armed, dropping pending wait", self.label);
            }
            previous.abort();
        }
    }

    /// Cancel the pending wait. Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        match self.slot.lock().take() {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Whether a wait is currently pending.
    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for SingleSlotTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SingleSlotTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleSlotTimer")
            .field("label", &self.label)
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_task(counter: &Arc<AtomicU32>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = SingleSlotTimer::new("test", Arc::new(TokioClock));
        let fired = Arc::new(AtomicU32::new(0));

        timer.arm(Duration::from_secs(60), counting_task(&fired));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending_task() {
        let timer = SingleSlotTimer::new("test", Arc::new(TokioClock));
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        timer.arm(Duration::from_secs(10), counting_task(&first));
        tokio::time::sleep(Duration::from_secs(5)).await;
        timer.arm(Duration::from_secs(10), counting_task(&second));

        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let timer = SingleSlotTimer::new("test", Arc::new(TokioClock));
        let fired = Arc::new(AtomicU32::new(0));

        timer.arm(Duration::from_secs(10), counting_task(&fired));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
