//! Synthesized download progress
//!
//! Document servers rarely announce a length we can trust, so progress is
//! estimated: it creeps up on a fixed cadence while the fetch is outstanding,
//! stalls at a ceiling below 100, and jumps to 100 only on success.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::ProgressConfig;

/// Progress value for the attempt in flight
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    value: u8,
    step: u8,
    ceiling: u8,
}

impl ProgressEstimator {
    /// Start at zero with the configured step and ceiling
    pub fn new(config: &ProgressConfig) -> Self {
        Self {
            value: 0,
            step: config.step.max(1),
            ceiling: config.ceiling.min(99),
        }
    }

    /// Current percentage, 0 to 100
    pub fn value(&self) -> u8 {
        self.value
    }

    /// Advance one step, never past the ceiling. Returns the new value.
    pub fn tick(&mut self) -> u8 {
        if self.value < self.ceiling {
            self.value = self.value.saturating_add(self.step).min(self.ceiling);
        }
        self.value
    }

    /// Jump to 100; only valid once the bytes are in hand
    pub fn complete(&mut self) -> u8 {
        self.value = 100;
        self.value
    }

    /// Back to zero; only valid between attempts
    pub fn reset(&mut self) {
        self.value = 0;
    }

    /// Whether the attempt finished successfully
    pub fn is_complete(&self) -> bool {
        self.value == 100
    }
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new(&ProgressConfig::default())
    }
}

/// Shortest cadence a ticker will run at; tokio rejects a zero period
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic progress task, aborted when dropped
///
/// Keep the ticker in the scope of the attempt it belongs to; leaving that
/// scope on any path (success, failure, cancellation) stops it.
#[derive(Debug)]
pub struct ProgressTicker {
    task: JoinHandle<()>,
}

impl ProgressTicker {
    /// Run `on_tick` every `interval`, starting one interval from now
    ///
    /// Intervals below [`MIN_TICK_INTERVAL`] are raised to it.
    pub fn start<F>(interval: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let interval = interval.max(MIN_TICK_INTERVAL);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut timer = tokio::time::interval_at(start, interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                // on_tick returns false once there is nothing left to advance
                if !on_tick() {
                    break;
                }
            }
        });

        Self { task }
    }

    /// Abort the task; same as dropping the ticker
    pub fn stop(self) {
        drop(self);
    }

    /// Whether the task has stopped on its own
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}
