//! Idle reaper: one rescheduled one-shot timer.
//!
//! Every [`IdleReaper::arm`] cancels the previous countdown and starts a new
//! one tagged with a fresh generation. A fire whose generation is no longer
//! current lost a race with a reset and must be ignored by the callback.
//!
//! Requests do not rearm the timer themselves. They record activity on the
//! lock-free [`ActivityTracker`], and a fire that finds recent activity
//! re-arms for the remainder of the interval.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Countdown toward idle teardown.
///
/// Not internally synchronized: the registry drives it under its lock.
#[derive(Debug)]
pub struct IdleReaper {
    idle_timeout: Duration,
    generation: u64,
    cancel_token: Option<CancellationToken>,
}

impl IdleReaper {
    /// Create a disarmed reaper.
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout, generation: 0, cancel_token: None }
    }

    /// Interval of inactivity before the callback runs.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether a countdown is running.
    pub fn is_armed(&self) -> bool {
        self.cancel_token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Whether `generation` belongs to the most recent arm.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_armed() && self.generation == generation
    }

    /// Restart the countdown. `on_fire` receives the generation it was armed
    /// with once the interval elapses without another arm or disarm.
    pub fn arm<F, Fut>(&mut self, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.arm_after(self.idle_timeout, on_fire)
    }

    /// Like [`arm`](Self::arm), but fire after `delay` instead of the full
    /// idle timeout.
    pub fn arm_after<F, Fut>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.generation += 1;

        let generation = self.generation;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        self.cancel_token = Some(token);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => on_fire(generation).await,
            }
        });

        tracing::trace!(generation, delay_ms = delay.as_millis() as u64, "Idle timer armed");
        generation
    }

    /// Stop the countdown, if any.
    pub fn disarm(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
            tracing::trace!(generation = self.generation, "Idle timer disarmed");
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Requests between pool lookup and connection release, and the time of
/// the most recent activity. Never takes the registry lock.
#[derive(Debug)]
pub struct ActivityTracker {
    in_flight: AtomicUsize,
    last_activity: Mutex<Instant>,
    drained: Notify,
}

impl ActivityTracker {
    /// Create an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            drained: Notify::new(),
        })
    }

    /// Record the start of a request. Activity ends when the guard drops.
    pub fn begin(self: &Arc<Self>) -> ActivityGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.record();
        ActivityGuard { tracker: self.clone() }
    }

    /// Mark now as the most recent activity.
    pub fn record(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the most recent activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Number of requests in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks one in-flight request.
#[derive(Debug)]
pub struct ActivityGuard {
    tracker: Arc<ActivityTracker>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}
