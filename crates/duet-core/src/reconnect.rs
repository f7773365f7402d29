//! Resume policy for a session whose transport dropped.
//!
//! The first resume attempt happens `initial_delay` after the loss. Each
//! failed attempt schedules the next with exponential backoff until
//! `max_attempts` is reached, after which the session stays disconnected.

use std::time::Duration;

/// Configuration for resume behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first resume attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            backoff_factor: 2.0,
            max_attempts: Some(3),
        }
    }
}

/// Delay before attempt number `attempt` (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Resume bookkeeping for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Attempts scheduled since the last successful open
    pub attempts: u32,
    /// When to attempt the next resume (ms since epoch)
    pub next_attempt_at: Option<u64>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the next attempt. Returns false, scheduling nothing, once
    /// the attempt budget is spent.
    pub fn schedule(&mut self, now_ms: u64, config: &ReconnectConfig) -> bool {
        if self.exceeded_max_attempts(config) {
            self.next_attempt_at = None;
            return false;
        }
        self.attempts += 1;
        let delay = calculate_backoff(self.attempts, config);
        self.next_attempt_at = Some(now_ms + delay.as_millis() as u64);
        true
    }

    /// Check if it's time to attempt a resume. Consumes the schedule.
    pub fn take_due(&mut self, now_ms: u64) -> bool {
        match self.next_attempt_at {
            Some(at) if now_ms >= at => {
                self.next_attempt_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.next_attempt_at.is_some()
    }

    pub fn cancel(&mut self) {
        self.next_attempt_at = None;
    }

    /// Reset after a successful open.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}
