//! Retry/Backoff Controller
//!
//! At most one pending retry per binding. A retry is a delayed
//! [`BindingEvent::RetryDue`] sent back to the binding's control queue, tagged
//! with a generation so that a retry canceled after it already fired is
//! recognized as stale and ignored.


use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::binding::BindingEvent;
use crate::config::RetryConfig;

/// Exponential backoff curve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64).min(self.max)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial,
            max: config.max,
            multiplier: config.multiplier,
        }
    }
}

/// Per-binding retry scheduler
pub struct RetryController {
    binding: String,
    policy: RetryPolicy,
    attempt: u32,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl RetryController {
    pub fn new(binding: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            binding: binding.into(),
            policy,
            attempt: 0,
            generation: 0,
            pending: None,
        }
    }

    /// Schedule a retry unless one is already pending.
    ///
    /// Returns the delay when a new retry was scheduled.
    pub fn schedule(&mut self, events: &mpsc::UnboundedSender<BindingEvent>) -> Option<Duration> {
        if self.is_pending() {
            return None;
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay(self.attempt);
        let generation = self.generation;
        info!(
            "Binding '{}': retry attempt {} in {:?}",
            self.binding, self.attempt, delay
        );

        let events = events.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(BindingEvent::RetryDue { generation });
        }));
        Some(delay)
    }

    /// Cancel the pending retry, if any, and invalidate one already queued
    pub fn cancel(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Consume a fired retry; false means it is stale and must be ignored
    pub fn accept(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.pending = None;
        true
    }

    /// Forget the attempt count after a successful start
    pub fn reset(&mut self) {
        self.cancel();
        self.attempt = 0;
    }

    /// Whether a retry is scheduled or fired but not yet accepted
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Attempts since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Drop for RetryController {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }
}
