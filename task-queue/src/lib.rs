//! Delayed-task primitives shared by the toon-sdk crates.
//!
//! Everything that waits in the SDK waits through a [`Clock`], so tests can
//! swap real timers for a virtual one:
//!
//! - [`RetryRunner`]: re-runs a fallible async operation with a deterministic
//!   delay between attempts.
//! - [`SingleSlotTimer`]: a one-shot timer where arming always replaces the
//!   previous pending wait.
//! - [`Debouncer`]: coalesces bursts of calls into a single invocation that
//!   uses the last arguments and answers every caller with the same result.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use task_queue::{IntervalPolicy, RetryRunner, TokioClock};
//!
//! # async fn fetch() -> Result<u32, String> { Ok(1) }
//! # async fn example() -> Result<(), String> {
//! let runner = RetryRunner::new(Arc::new(TokioClock));
//! let policy = IntervalPolicy::exponential(Duration::from_secs(6));
//! let value = runner.run(|_attempt| fetch(), 10, &policy).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod debounce;
pub mod retry;
pub mod timer;

pub use clock::{Clock, RecordingClock, TokioClock};
pub use debounce::{DebounceError, Debouncer};
pub use retry::{IntervalPolicy, RetryRunner};
pub use timer::SingleSlotTimer;
