//! Periodic keep-alive scheduler
//!
//! The charge controller drops into its fallback state when no heartbeat
//! write arrives within 10 seconds. The scheduler fires one beat after a short
//! grace delay and then on a fixed interval below that window.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument, Span};

use crate::error::Result;

/// Grace period before the first beat
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
/// Beat period
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(9);
/// Device-side staleness window; the interval must stay below it
pub const DEVICE_WINDOW: Duration = Duration::from_secs(10);

pub struct KeepAliveScheduler {
    initial_delay: Duration,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl KeepAliveScheduler {
    pub fn new(initial_delay: Duration, interval: Duration) -> Self {
        Self {
            initial_delay,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start beating. No-op while already running.
    ///
    /// `beat` is invoked once per tick; its errors are logged and the loop
    /// carries on. Must be called from within a Tokio runtime.
    pub fn start<F, Fut>(&self, beat: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            debug!("Keep-alive already running");
            return;
        }

        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        let period = self.interval;
        let mut ticker = interval_at(Instant::now() + self.initial_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            "Keep-alive started: delay={}ms, interval={}ms",
            self.initial_delay.as_millis(),
            period.as_millis()
        );

        let beats = async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                if let Err(e) = beat().await {
                    warn!("Keep-alive failed: {}", e);
                }
            }
            debug!("Keep-alive loop exited");
        };
        tokio::spawn(beats.instrument(Span::current()));
    }

    /// Cancel the pending first beat and the recurring timer. Safe when idle.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            debug!("Keep-alive stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }
}

impl Default for KeepAliveScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_INTERVAL)
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
