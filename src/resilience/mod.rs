//! Retry and throttling for the dispatch loop.
//!
//! [`BackoffSender`] retries transient relay failures with exponential
//! backoff. [`ThrottleGovernor`] paces sends per window and enforces the
//! daily cap.

use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::{RetryConfig, ThrottleConfig, ThrottlePolicy};
use crate::errors::CampaignError;
use crate::observability::{CampaignEvent, CampaignObserver};
use crate::relay::{OutboundMessage, RelayHandle, RelaySession};

/// Result of sending one message with retries.
#[derive(Debug)]
pub enum RetryOutcome {
    /// The relay accepted the message.
    Delivered {
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Every attempt failed with a transient error.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: CampaignError,
    },
    /// An attempt failed with an error that retrying cannot fix.
    Rejected {
        /// Attempts made.
        attempts: u32,
        /// The error.
        error: CampaignError,
    },
}

impl RetryOutcome {
    /// Returns true if the message went out.
    pub fn is_delivered(&self) -> bool {
        matches!(self, RetryOutcome::Delivered { .. })
    }

    /// Returns the number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Delivered { attempts }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Rejected { attempts, .. } => *attempts,
        }
    }
}

/// Sends one message with bounded retries.
#[derive(Debug, Clone)]
pub struct BackoffSender {
    config: RetryConfig,
}

impl BackoffSender {
    /// Creates a sender.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay after the zero-based `attempt` failed: `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Attempts delivery up to the configured number of times.
    ///
    /// Each transient failure is reported to `observer` and followed by a
    /// backoff sleep, including the last one. Permanent failures end the
    /// call immediately.
    pub async fn send_with_retry<S: RelaySession>(
        &self,
        handle: &mut RelayHandle<S>,
        message: &OutboundMessage,
        observer: &dyn CampaignObserver,
    ) -> RetryOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            match handle.send_one(message).await {
                Ok(()) => {
                    return RetryOutcome::Delivered {
                        attempts: attempt + 1,
                    }
                }
                Err(error) if !error.is_retryable() => {
                    return RetryOutcome::Rejected {
                        attempts: attempt + 1,
                        error,
                    }
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    observer.on_event(&CampaignEvent::RetryScheduled {
                        recipient: message.to.clone(),
                        attempt: attempt + 1,
                        max_attempts,
                        delay,
                        error: error.to_string(),
                    });
                    sleep(delay).await;
                    last_error = Some(error);
                }
            }
        }

        RetryOutcome::Exhausted {
            attempts: max_attempts,
            last_error: last_error
                .unwrap_or_else(|| CampaignError::delivery("Retry attempts exhausted")),
        }
    }
}

/// Paces sends and tracks the daily cap.
#[derive(Debug)]
pub struct ThrottleGovernor {
    config: ThrottleConfig,
    sent_today: u32,
    window_start: Option<Instant>,
    in_window: u32,
}

impl ThrottleGovernor {
    /// Creates a governor.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            sent_today: 0,
            window_start: None,
            in_window: 0,
        }
    }

    /// Fixed-window pause before the recipient at `index`, if any.
    ///
    /// Pauses once every `rate_limit` recipients regardless of how long the
    /// sends took.
    pub fn fixed_window_pause(&self, index: usize) -> Option<Duration> {
        let rate = self.config.rate_limit.max(1) as usize;
        if index > 0 && index % rate == 0 {
            Some(self.config.window)
        } else {
            None
        }
    }

    /// Waits as long as the policy demands before the recipient at `index`.
    /// Returns the pause taken.
    pub async fn acquire(&mut self, index: usize) -> Option<Duration> {
        let pause = match self.config.policy {
            ThrottlePolicy::FixedWindow => self.fixed_window_pause(index),
            ThrottlePolicy::ElapsedWindow => self.elapsed_window_pause(),
        };

        if let Some(pause) = pause {
            tracing::debug!(index, pause_ms = pause.as_millis() as u64, "Throttling");
            sleep(pause).await;
            if self.config.policy == ThrottlePolicy::ElapsedWindow {
                self.window_start = Some(Instant::now());
                self.in_window = 0;
            }
        }

        self.in_window += 1;
        pause
    }

    fn elapsed_window_pause(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.duration_since(start);

        if elapsed >= self.config.window {
            self.window_start = Some(now);
            self.in_window = 0;
            return None;
        }
        if self.in_window >= self.config.rate_limit {
            return Some(self.config.window - elapsed);
        }
        None
    }

    /// Counts one accepted message against the daily cap.
    pub fn record_sent(&mut self) {
        self.sent_today += 1;
    }

    /// Messages counted against the daily cap.
    pub fn sent_today(&self) -> u32 {
        self.sent_today
    }

    /// Returns true once the daily cap is used up.
    pub fn daily_cap_reached(&self) -> bool {
        self.sent_today >= self.config.daily_limit
    }

    /// Configured daily cap.
    pub fn daily_limit(&self) -> u32 {
        self.config.daily_limit
    }
}
