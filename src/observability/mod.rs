//! Progress reporting.
//!
//! The dispatcher reports everything it does as a [`CampaignEvent`] to a
//! [`CampaignObserver`]. [`TracingObserver`] forwards events to `tracing`.

use chrono::NaiveTime;
use std::fmt;
use std::time::Duration;

use crate::metrics::MetricsSnapshot;
use crate::tracking::DeliveryStatus;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    /// Routine progress.
    Info,
    /// A recipient was sent to.
    Success,
    /// Something went wrong but the run continues.
    Warning,
    /// A recipient or the whole run failed.
    Error,
}

impl EventLevel {
    /// Returns the level name.
    pub fn name(&self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Success => "SUCCESS",
            EventLevel::Warning => "WARN",
            EventLevel::Error => "ERROR",
        }
    }
}

/// Something the dispatcher wants the operator to know.
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignEvent {
    /// Logged into the relay.
    Connected {
        /// Relay `host:port`.
        relay: String,
    },
    /// The relay could not be reached or refused the login.
    ConnectionFailed {
        /// Failure description.
        error: String,
    },
    /// Dispatch is held until a time of day.
    WaitingForSchedule {
        /// Release time.
        at: NaiveTime,
    },
    /// The scheduled time was reached.
    ScheduleReached,
    /// A send attempt failed and will be retried after `delay`.
    RetryScheduled {
        /// Recipient address.
        recipient: String,
        /// One-based attempt that failed.
        attempt: u32,
        /// Configured attempt limit.
        max_attempts: u32,
        /// Wait before the next attempt.
        delay: Duration,
        /// Failure description.
        error: String,
    },
    /// The relay accepted the message.
    RecipientSent {
        /// Recipient address.
        recipient: String,
        /// Reported delivery status.
        status: DeliveryStatus,
    },
    /// The recipient was given up on.
    RecipientFailed {
        /// Recipient address.
        recipient: String,
        /// Attempts made.
        attempts: u32,
        /// Failure description.
        error: String,
    },
    /// Sending pauses to honor the rate limit.
    ThrottlePause {
        /// Index of the recipient about to be sent.
        index: usize,
        /// Length of the pause.
        pause: Duration,
    },
    /// The daily limit stops the run.
    DailyLimitReached {
        /// Configured limit.
        limit: u32,
    },
    /// The caller asked the run to stop.
    StopRequested,
    /// A fatal error ended the run after the session was open.
    Aborted {
        /// Failure description.
        error: String,
    },
    /// Counters changed.
    MetricsUpdated(MetricsSnapshot),
    /// Final failure count.
    FailureSummary {
        /// Entries in the failure ledger.
        failed: usize,
    },
    /// The run finished.
    Completed {
        /// Messages sent.
        sent: u64,
        /// Recipients failed.
        failed: u64,
        /// Recipients left unprocessed.
        pending: u64,
    },
}

impl CampaignEvent {
    /// Returns the event severity.
    pub fn level(&self) -> EventLevel {
        match self {
            CampaignEvent::RecipientSent { .. } => EventLevel::Success,
            CampaignEvent::RetryScheduled { .. }
            | CampaignEvent::DailyLimitReached { .. }
            | CampaignEvent::StopRequested
            | CampaignEvent::FailureSummary { .. } => EventLevel::Warning,
            CampaignEvent::ConnectionFailed { .. }
            | CampaignEvent::RecipientFailed { .. }
            | CampaignEvent::Aborted { .. } => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }
}

impl fmt::Display for CampaignEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampaignEvent::Connected { relay } => {
                write!(f, "Successfully logged into email server {}.", relay)
            }
            CampaignEvent::ConnectionFailed { error } => {
                write!(f, "Failed to connect to the email server: {}", error)
            }
            CampaignEvent::WaitingForSchedule { at } => {
                write!(f, "Waiting until {} to start sending emails.", at.format("%H:%M:%S"))
            }
            CampaignEvent::ScheduleReached => {
                f.write_str("Scheduled time reached. Starting to send emails.")
            }
            CampaignEvent::RetryScheduled {
                recipient,
                attempt,
                delay,
                ..
            } => write!(
                f,
                "Attempt {} failed for {}. Retrying after {}.",
                attempt,
                recipient,
                humantime::format_duration(*delay)
            ),
            CampaignEvent::RecipientSent { recipient, .. } => {
                write!(f, "Email sent to {}", recipient)
            }
            CampaignEvent::RecipientFailed {
                recipient,
                attempts,
                error,
            } => write!(
                f,
                "Failed to send email to {} after {} attempts: {}",
                recipient, attempts, error
            ),
            CampaignEvent::ThrottlePause { pause, .. } => write!(
                f,
                "Rate limit reached. Pausing for {}.",
                humantime::format_duration(*pause)
            ),
            CampaignEvent::DailyLimitReached { .. } => {
                f.write_str("Daily email limit reached. Stopping campaign.")
            }
            CampaignEvent::StopRequested => f.write_str("Stop requested. Stopping campaign."),
            CampaignEvent::Aborted { error } => write!(f, "Campaign aborted: {}", error),
            CampaignEvent::MetricsUpdated(snapshot) => write!(f, "{}", snapshot),
            CampaignEvent::FailureSummary { failed } => write!(
                f,
                "{} emails failed to send. Check log for details.",
                failed
            ),
            CampaignEvent::Completed {
                sent,
                failed,
                pending,
            } => write!(
                f,
                "Campaign finished: {} sent, {} failed, {} pending.",
                sent, failed, pending
            ),
        }
    }
}

/// Receives campaign events as they happen.
pub trait CampaignObserver: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &CampaignEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CampaignObserver for TracingObserver {
    fn on_event(&self, event: &CampaignEvent) {
        match event {
            CampaignEvent::RetryScheduled {
                recipient,
                attempt,
                max_attempts,
                delay,
                error,
            } => tracing::warn!(
                recipient = %recipient,
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "{}",
                event
            ),
            CampaignEvent::MetricsUpdated(snapshot) => tracing::info!(
                sent = snapshot.sent,
                failed = snapshot.failed,
                pending = snapshot.pending,
                response_rate = snapshot.response_rate,
                "{}",
                snapshot.lines().join(" | ")
            ),
            _ => {
                let severity = event.level().name();
                match event.level() {
                    EventLevel::Info | EventLevel::Success => tracing::info!(severity, "{}", event),
                    EventLevel::Warning => tracing::warn!(severity, "{}", event),
                    EventLevel::Error => tracing::error!(severity, "{}", event),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CampaignMetrics;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_at_info(events: &[CampaignEvent]) -> String {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            for event in events {
                TracingObserver.on_event(event);
            }
        });
        let bytes = log.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_metrics_visible_at_info() {
        let metrics = CampaignMetrics::new(3);
        metrics.record_sent(DeliveryStatus::Opened);
        metrics.record_failed();

        let output = capture_at_info(&[CampaignEvent::MetricsUpdated(metrics.snapshot())]);

        assert!(output.contains("INFO"));
        assert!(output.contains("Total Emails Sent: 1"));
        assert!(output.contains("Emails Pending: 1"));
        assert!(output.contains("Response Rate: 100.00%"));
    }

    #[test]
    fn test_warnings_carry_severity() {
        let output = capture_at_info(&[CampaignEvent::DailyLimitReached { limit: 5 }]);
        assert!(output.contains("WARN"));
        assert!(output.contains("severity=\"WARN\""));
    }

    #[test]
    fn test_event_levels() {
        let sent = CampaignEvent::RecipientSent {
            recipient: "a@b.com".to_string(),
            status: DeliveryStatus::Delivered,
        };
        assert_eq!(sent.level(), EventLevel::Success);
        assert_eq!(
            CampaignEvent::DailyLimitReached { limit: 5 }.level(),
            EventLevel::Warning
        );
        assert_eq!(
            CampaignEvent::ConnectionFailed {
                error: "refused".to_string()
            }
            .level(),
            EventLevel::Error
        );
        assert!(EventLevel::Error > EventLevel::Warning);
    }

    #[test]
    fn test_event_text() {
        let retry = CampaignEvent::RetryScheduled {
            recipient: "a@b.com".to_string(),
            attempt: 1,
            max_attempts: 3,
            delay: Duration::from_secs(5),
            error: "451 busy".to_string(),
        };
        assert_eq!(
            retry.to_string(),
            "Attempt 1 failed for a@b.com. Retrying after 5s."
        );
        assert_eq!(
            CampaignEvent::FailureSummary { failed: 2 }.to_string(),
            "2 emails failed to send. Check log for details."
        );
        assert_eq!(
            CampaignEvent::DailyLimitReached { limit: 5 }.to_string(),
            "Daily email limit reached. Stopping campaign."
        );
    }
}
