//! Call coalescing.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;

/// Errors returned to a debounced caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DebounceError {
    /// The debouncer was dropped before the coalesced call ran.
    #[error("Debounced call was cancelled")]
    Cancelled,
}

type Action<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>;

struct Pending<A, R> {
    args: Option<A>,
    waiters: Vec<oneshot::Sender<R>>,
}

/// Collapses bursts of calls into one invocation.
///
/// Every call restarts the quiet window. When the window elapses without a
/// new call, the action runs once with the most recent arguments and every
/// caller that joined the burst receives a clone of the same result.
pub struct Debouncer<A, R> {
    window: Duration,
    clock: Arc<dyn Clock>,
    action: Action<A, R>,
    pending: Arc<Mutex<Pending<A, R>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<A, R> Debouncer<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<F>(window: Duration, clock: Arc<dyn Clock>, action: F) -> Self
    where
        F: Fn(A) -> BoxFuture<'static, R> + Send + Sync + 'static,
    {
        Self {
            window,
            clock,
            action: Arc::new(action),
            pending: Arc::new(Mutex::new(Pending {
                args: None,
                waiters: Vec::new(),
            })),
            timer: Mutex::new(None),
        }
    }

    /// Join the current burst with `args` and wait for the coalesced result.
    pub async fn call(&self, args: A) -> Result<R, DebounceError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            pending.args = Some(args);
            pending.waiters.push(tx);
        }
        self.rearm();
        rx.await.map_err(|_| DebounceError::Cancelled)
    }

    /// Number of callers waiting on the current burst.
    pub fn waiting(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    fn rearm(&self) {
        let window = self.window;
        let clock = Arc::clone(&self.clock);
        let pending = Arc::clone(&self.pending);
        let action = Arc::clone(&self.action);

        let handle = tokio::spawn(async move {
            clock.sleep(window).await;

            let (args, waiters) = {
                let mut pending = pending.lock();
                (pending.args.take(), std::mem::take(&mut pending.waiters))
            };
            let Some(args) = args else {
                return;
            };

            debug!("Debounce window elapsed, running once for {} callers", waiters.len());
            // Detached so a later burst cannot abort an in-flight call.
            tokio::spawn(async move {
                let result = action(args).await;
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        });

        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl<A, R> Drop for Debouncer<A, R> {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn recording_debouncer(
        calls: Arc<Mutex<Vec<u32>>>,
    ) -> Debouncer<u32, Result<u32, String>> {
        Debouncer::new(Duration::from_millis(500), Arc::new(TokioClock), move |value| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push(value);
                Ok(value * 10)
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_value() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let debouncer = recording_debouncer(Arc::clone(&calls));

        let (a, b, c) = tokio::join!(debouncer.call(1), debouncer.call(2), debouncer.call(3));

        assert_eq!(a.unwrap(), Ok(30));
        assert_eq!(b.unwrap(), Ok(30));
        assert_eq!(c.unwrap(), Ok(30));
        assert_eq!(*calls.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_bursts_run_separately() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let debouncer = recording_debouncer(Arc::clone(&calls));

        assert_eq!(debouncer.call(1).await.unwrap(), Ok(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(debouncer.call(2).await.unwrap(), Ok(20));

        assert_eq!(*calls.lock(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_inside_window_restarts_it() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let debouncer = Arc::new(Debouncer::new(
            Duration::from_millis(500),
            Arc::new(TokioClock),
            move |_: ()| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            },
        ));

        let first = tokio::spawn({
            let debouncer = Arc::clone(&debouncer);
            async move { debouncer.call(()).await }
        });
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(debouncer.waiting(), 1);

        let second = debouncer.call(());
        let (first, second) = tokio::join!(first, second);

        assert!(first.unwrap().is_ok());
        assert!(second.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
