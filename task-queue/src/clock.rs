//! Time source abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Source of time for every delayed task in the SDK.
///
/// Production code uses [`TokioClock`]. Tests either run tokio with paused
/// time or inject a [`RecordingClock`] to observe the exact delays requested.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current instant according to this clock.
    fn now(&self) -> Instant;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock that records requested sleeps and returns immediately.
///
/// Each `sleep` advances the clock's own notion of "now" by the requested
/// duration, so `now()` reflects the total virtual time waited.
#[derive(Debug, Clone)]
pub struct RecordingClock {
    inner: Arc<Mutex<RecordingState>>,
}

#[derive(Debug)]
struct RecordingState {
    origin: Instant,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RecordingState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().sleeps.clone()
    }

    /// Total virtual time elapsed.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }
}

impl Default for RecordingClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.origin + state.elapsed
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.inner.lock();
            state.sleeps.push(duration);
            state.elapsed += duration;
        }
        tokio::task::yield_now().await;
    }
}
