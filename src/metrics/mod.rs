//! Campaign counters.
//!
//! One lock guards all counters so a snapshot never mixes two outcomes.
//! `pending` and the response rate are derived, never stored.

use serde::Serialize;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::tracking::DeliveryStatus;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total: u64,
    sent: u64,
    failed: u64,
    statuses: [u64; 4],
}

/// Live campaign counters, shareable behind an `Arc`.
#[derive(Debug, Default)]
pub struct CampaignMetrics {
    counters: RwLock<Counters>,
}

impl CampaignMetrics {
    /// Creates counters for `total` recipients.
    pub fn new(total: u64) -> Self {
        Self {
            counters: RwLock::new(Counters {
                total,
                ..Counters::default()
            }),
        }
    }

    /// Clears all counters and sets the recipient total.
    pub fn reset(&self, total: u64) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        *counters = Counters {
            total,
            ..Counters::default()
        };
    }

    /// Records an accepted message and its delivery status.
    pub fn record_sent(&self, status: DeliveryStatus) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.sent += 1;
        counters.statuses[status.index()] += 1;
    }

    /// Records a recipient that could not be sent to.
    pub fn record_failed(&self) {
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        counters.failed += 1;
    }

    /// Total messages sent.
    pub fn sent(&self) -> u64 {
        self.snapshot().sent
    }

    /// Total recipients failed.
    pub fn failed(&self) -> u64 {
        self.snapshot().failed
    }

    /// Recipients not yet processed.
    pub fn pending(&self) -> u64 {
        self.snapshot().pending
    }

    /// Opened ÷ sent, 0 when nothing was sent.
    pub fn response_rate(&self) -> f64 {
        self.snapshot().response_rate
    }

    /// Returns a consistent copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = *self.counters.read().unwrap_or_else(PoisonError::into_inner);
        MetricsSnapshot::from_counters(counters)
    }
}

/// Point-in-time view of the campaign counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Recipients in the run.
    pub total: u64,
    /// Messages the relay accepted.
    pub sent: u64,
    /// Recipients recorded as failed.
    pub failed: u64,
    /// `total - sent - failed`.
    pub pending: u64,
    /// Accepted messages reported opened.
    pub opened: u64,
    /// Accepted messages reported bounced.
    pub bounced: u64,
    /// `opened / sent`, in `[0, 1]`.
    pub response_rate: f64,
}

impl MetricsSnapshot {
    fn from_counters(counters: Counters) -> Self {
        let opened = counters.statuses[DeliveryStatus::Opened.index()];
        let response_rate = if counters.sent == 0 {
            0.0
        } else {
            opened as f64 / counters.sent as f64
        };
        Self {
            total: counters.total,
            sent: counters.sent,
            failed: counters.failed,
            pending: counters
                .total
                .saturating_sub(counters.sent)
                .saturating_sub(counters.failed),
            opened,
            bounced: counters.statuses[DeliveryStatus::Bounced.index()],
            response_rate,
        }
    }

    /// Human-readable lines; the response rate appears once something was sent.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("Total Emails Sent: {}", self.sent),
            format!("Emails Pending: {}", self.pending),
            format!("Emails Failed: {}", self.failed),
        ];
        if self.sent > 0 {
            lines.push(format!("Response Rate: {:.2}%", self.response_rate * 100.0));
        }
        lines
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines().join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_metrics() {
        let metrics = CampaignMetrics::new(4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pending, 4);
        assert_eq!(snapshot.response_rate, 0.0);
        assert_eq!(snapshot.lines().len(), 3);
    }

    #[test]
    fn test_counts_add_up() {
        let metrics = CampaignMetrics::new(5);
        metrics.record_sent(DeliveryStatus::Opened);
        metrics.record_sent(DeliveryStatus::Delivered);
        metrics.record_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sent, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.sent + snapshot.failed + snapshot.pending, snapshot.total);
        assert_eq!(snapshot.response_rate, 0.5);
    }

    #[test]
    fn test_metrics_text() {
        let metrics = CampaignMetrics::new(3);
        metrics.record_sent(DeliveryStatus::Opened);
        metrics.record_sent(DeliveryStatus::Bounced);
        metrics.record_sent(DeliveryStatus::Pending);

        assert_eq!(
            metrics.snapshot().to_string(),
            "Total Emails Sent: 3\nEmails Pending: 0\nEmails Failed: 0\nResponse Rate: 33.33%"
        );
    }

    #[test]
    fn test_reset() {
        let metrics = CampaignMetrics::new(2);
        metrics.record_failed();
        metrics.reset(7);
        assert_eq!(metrics.failed(), 0);
        assert_eq!(metrics.pending(), 7);
    }
}
