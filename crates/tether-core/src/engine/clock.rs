//! Timer service: the engine's single time source and wake-up scheduler.
//!
//! Provides:
//! - `now()` derived from the tokio clock anchored at a wall-clock instant,
//!   so persisted timestamps and delays agree (and follow paused time in tests)
//! - one-shot wakes that feed `TimerFired` resume events to the scheduler
//! - repeating interval tickers for interval-triggered jobs
//! - shutdown that cancels every pending wake and ticker

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::scheduler::{ResumeEvent, ResumeSender};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while registering timers.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// Interval period must be greater than zero.
    #[error("invalid interval period for job '{0}'")]
    InvalidPeriod(String),

    /// The service was shut down.
    #[error("timer service is shut down")]
    ShutDown,
}

/// Callback invoked on every interval tick with the job ID and fire time.
pub type IntervalCallback =
    Arc<dyn Fn(String, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

// ---------------------------------------------------------------------------
// TimerService
// ---------------------------------------------------------------------------

/// Schedules future wake-ups for runs and drives interval triggers.
///
/// Wake delivery is at-least-once: a fired timer only enqueues a resume
/// event, and the checkpoint discipline makes duplicates harmless.
pub struct TimerService {
    base_utc: DateTime<Utc>,
    base_instant: Instant,
    sender: ResumeSender,
    cancel: CancellationToken,
    intervals: DashMap<String, JoinHandle<()>>,
}

impl TimerService {
    /// Create a timer service that delivers wakes through `sender`.
    pub fn new(sender: ResumeSender) -> Self {
        Self {
            base_utc: Utc::now(),
            base_instant: Instant::now(),
            sender,
            cancel: CancellationToken::new(),
            intervals: DashMap::new(),
        }
    }

    /// Current engine time.
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.base_instant);
        self.base_utc + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
    }

    /// Fire a `TimerFired` resume event for `(run_id, step_key)` after `delay`.
    pub fn schedule_wake(&self, run_id: Uuid, step_key: &str, delay: Duration) {
        let sender = self.sender.clone();
        let cancel = self.cancel.clone();
        let step_key = step_key.to_string();
        let deadline = Instant::now() + delay;

        tracing::debug!(run_id = %run_id, step_key = %step_key, delay_ms = delay.as_millis() as u64, "wake scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if let Err(e) = sender.resume(run_id, ResumeEvent::TimerFired { step_key }) {
                        tracing::warn!(run_id = %run_id, error = %e, "failed to deliver wake");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Fire a `TimerFired` resume event at `at` (immediately if already past).
    pub fn schedule_wake_at(&self, run_id: Uuid, step_key: &str, at: DateTime<Utc>) {
        let delay = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_wake(run_id, step_key, delay);
    }

    /// Register a repeating ticker for an interval-triggered job.
    ///
    /// The first tick fires one `period` after registration. Registering the
    /// same job again replaces its ticker.
    pub fn register_interval(
        &self,
        job_id: &str,
        period: Duration,
        callback: IntervalCallback,
    ) -> Result<(), TimerError> {
        if period.is_zero() {
            return Err(TimerError::InvalidPeriod(job_id.to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(TimerError::ShutDown);
        }

        let cancel = self.cancel.clone();
        let id = job_id.to_string();
        let base_utc = self.base_utc;
        let base_instant = self.base_instant;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    tick = ticker.tick() => {
                        let elapsed = tick.saturating_duration_since(base_instant);
                        let fired_at = base_utc
                            + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
                        tracing::debug!(job_id = %id, %fired_at, "interval trigger fired");
                        callback(id.clone(), fired_at).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        if let Some(previous) = self.intervals.insert(job_id.to_string(), handle) {
            previous.abort();
        }

        tracing::info!(job_id, period_secs = period.as_secs(), "interval trigger registered");
        Ok(())
    }

    /// Stop an interval ticker. Returns `true` if one was registered.
    pub fn cancel_interval(&self, job_id: &str) -> bool {
        match self.intervals.remove(job_id) {
            Some((_, handle)) => {
                handle.abort();
                tracing::info!(job_id, "interval trigger cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending wake and interval ticker.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.intervals.clear();
        tracing::info!("timer service stopped");
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("base_utc", &self.base_utc)
            .field("intervals", &self.intervals.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
