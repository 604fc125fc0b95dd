//! Injectable time source.
//!
//! Every wait in the daemon (reconnect backoff, per-command delay, read
//! deadlines, poll pacing) goes through [`Clock`] so that tests can drive
//! virtual time. Production uses [`SystemClock`], which delegates to
//! `tokio::time` and therefore also honours tokio's paused test clock.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Returns a future resolving after `duration`. The future must be
    /// cancel-safe: dropping it abandons the wait.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
