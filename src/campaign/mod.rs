//! Campaign dispatch.
//!
//! [`CampaignDispatcher`] runs one campaign over one relay session:
//!
//! ```text
//! Idle -> Connecting -> (Waiting) -> Sending -> Completed
//!             |                         |
//!             +--------> Failed <-------+
//! ```
//!
//! Per recipient it checks for a stop request and the daily cap, waits for
//! the throttle, renders the message, sends it with retries and records the
//! outcome. The session is closed on every exit path once it was opened.

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CampaignConfig;
use crate::errors::{CampaignError, CampaignErrorKind, CampaignResult};
use crate::metrics::{CampaignMetrics, MetricsSnapshot};
use crate::observability::{CampaignEvent, CampaignObserver, TracingObserver};
use crate::recipients::{RecipientRecord, RecipientTable};
use crate::relay::{
    OutboundMessage, RelayConnectionManager, RelayConnector, RelayHandle, SmtpConnector,
};
use crate::resilience::{BackoffSender, RetryOutcome, ThrottleGovernor};
use crate::scheduler::{CampaignScheduler, GateRelease, SystemClock, WallClock};
use crate::template::MessageTemplate;
use crate::tracking::{DeliveryStatus, DeliveryStatusSource, SimulatedStatusSource};

/// Cooperative stop signal, polled once per recipient.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    /// Creates a handle with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the run to stop before the next recipient.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Dispatcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    /// Not started.
    Idle,
    /// Opening and authenticating the relay session.
    Connecting,
    /// Holding for the scheduled start.
    Waiting,
    /// Processing recipients.
    Sending,
    /// Finished normally.
    Completed,
    /// Aborted by a fatal error.
    Failed,
}

/// Terminal result for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// The relay accepted the message.
    Sent {
        /// Reported delivery status.
        status: DeliveryStatus,
        /// Attempts used.
        attempts: u32,
    },
    /// The recipient was given up on.
    Failed {
        /// Why.
        reason: String,
        /// Attempts made.
        attempts: u32,
    },
}

impl SendOutcome {
    /// Returns true for [`SendOutcome::Sent`].
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// Outcome recorded for the recipient at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientOutcome {
    /// Position in the recipient table.
    pub index: usize,
    /// Recipient address.
    pub recipient: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: SendOutcome,
}

/// One failed recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Recipient address.
    pub email: String,
    /// Failure description.
    pub error: String,
}

/// Append-only list of failed recipients.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct FailureLedger {
    entries: Vec<FailureRecord>,
}

impl FailureLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a failure.
    pub fn record(&mut self, email: impl Into<String>, error: impl Into<String>) {
        self.entries.push(FailureRecord {
            email: email.into(),
            error: error.into(),
        });
    }

    /// Returns the failures in the order they happened.
    pub fn entries(&self) -> &[FailureRecord] {
        &self.entries
    }

    /// Number of failures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing failed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the ledger as a JSON array.
    pub fn to_json(&self) -> CampaignResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            CampaignError::new(CampaignErrorKind::Unknown, format!("Cannot serialize failures: {}", e))
                .with_cause(e)
        })
    }

    /// Writes the ledger to a JSON file.
    pub fn write_json(&self, path: impl AsRef<Path>) -> CampaignResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?).map_err(|e| {
            CampaignError::new(
                CampaignErrorKind::Unknown,
                format!("Cannot write {}: {}", path.display(), e),
            )
            .with_cause(e)
        })
    }
}

/// Why the run stopped sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Every recipient has an outcome.
    AllProcessed,
    /// The daily cap was reached; the rest stay pending.
    DailyCapReached,
    /// A stop was requested.
    Stopped,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignReport {
    /// Why sending stopped.
    pub completion: CompletionReason,
    /// Per-recipient outcomes, in processing order.
    pub outcomes: Vec<RecipientOutcome>,
    /// Failed recipients.
    pub failures: FailureLedger,
    /// Final counters.
    pub metrics: MetricsSnapshot,
}

impl CampaignReport {
    /// Operator summary, present when something failed.
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(CampaignEvent::FailureSummary {
                failed: self.failures.len(),
            }
            .to_string())
        }
    }
}

/// Runs a campaign over one relay session.
pub struct CampaignDispatcher<C: RelayConnector> {
    config: CampaignConfig,
    manager: RelayConnectionManager<C>,
    sender: BackoffSender,
    template: MessageTemplate,
    observer: Arc<dyn CampaignObserver>,
    status_source: Box<dyn DeliveryStatusSource>,
    clock: Arc<dyn WallClock>,
    metrics: Arc<CampaignMetrics>,
    stop: StopHandle,
    state: DispatchState,
    outcomes: Vec<RecipientOutcome>,
    failures: FailureLedger,
}

impl CampaignDispatcher<SmtpConnector> {
    /// Creates a dispatcher that talks SMTP to the configured relay.
    pub fn smtp(config: CampaignConfig) -> CampaignResult<Self> {
        let connector = SmtpConnector::new(config.relay.clone());
        Self::new(config, connector)
    }
}

impl<C: RelayConnector> CampaignDispatcher<C> {
    /// Creates a dispatcher. The configuration is validated here.
    pub fn new(config: CampaignConfig, connector: C) -> CampaignResult<Self> {
        config.validate()?;
        let credentials = config.credentials();
        Ok(Self {
            sender: BackoffSender::new(config.retry.clone()),
            template: MessageTemplate::new(config.template.clone()),
            manager: RelayConnectionManager::new(connector, credentials),
            observer: Arc::new(TracingObserver),
            status_source: Box::new(SimulatedStatusSource::new()),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(CampaignMetrics::default()),
            stop: StopHandle::new(),
            state: DispatchState::Idle,
            outcomes: Vec::new(),
            failures: FailureLedger::new(),
            config,
        })
    }

    /// Replaces the event observer.
    pub fn with_observer(mut self, observer: Arc<dyn CampaignObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replaces the delivery status source.
    pub fn with_status_source(mut self, source: Box<dyn DeliveryStatusSource>) -> Self {
        self.status_source = source;
        self
    }

    /// Replaces the wall clock used by the scheduler.
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses an existing stop handle.
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Returns a handle that stops the run before the next recipient.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Returns the live counters.
    pub fn metrics(&self) -> Arc<CampaignMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Failures recorded so far, also after an aborted run.
    pub fn failures(&self) -> &FailureLedger {
        &self.failures
    }

    /// Outcomes recorded so far.
    pub fn outcomes(&self) -> &[RecipientOutcome] {
        &self.outcomes
    }

    /// Renders the message for one recipient.
    pub fn render(&self, record: &RecipientRecord) -> OutboundMessage {
        OutboundMessage::new(
            self.config.sender.clone(),
            record.email(),
            self.config.subject.clone(),
            self.template.render(record),
        )
    }

    fn transition(&mut self, next: DispatchState) {
        tracing::debug!(from = ?self.state, to = ?next, "Dispatch state change");
        self.state = next;
    }

    /// Runs the campaign to completion.
    ///
    /// Validation errors are returned before any connection attempt.
    /// Connection and authentication failures, at start or mid-run, move the
    /// dispatcher to `Failed`; per-recipient failures do not.
    pub async fn run(&mut self, recipients: &RecipientTable) -> CampaignResult<CampaignReport> {
        if self.state != DispatchState::Idle {
            return Err(CampaignError::new(
                CampaignErrorKind::CommandSequenceError,
                "Campaign has already been run",
            ));
        }
        recipients.validate()?;

        let unknown = self.template.unknown_placeholders(recipients.columns());
        if !unknown.is_empty() {
            tracing::warn!(placeholders = ?unknown, "Template references columns the data does not have");
        }

        self.metrics.reset(recipients.len() as u64);
        self.transition(DispatchState::Connecting);

        let mut handle = match self.manager.connect().await {
            Ok(handle) => handle,
            Err(error) => {
                self.transition(DispatchState::Failed);
                self.observer.on_event(&CampaignEvent::ConnectionFailed {
                    error: error.to_string(),
                });
                return Err(error);
            }
        };
        self.observer.on_event(&CampaignEvent::Connected {
            relay: self.config.relay.address(),
        });

        let result = self.dispatch(&mut handle, recipients).await;

        if let Err(error) = handle.close().await {
            tracing::warn!(error = %error, "Closing relay session failed");
        }

        match result {
            Ok(completion) => {
                self.transition(DispatchState::Completed);
                let report = CampaignReport {
                    completion,
                    outcomes: self.outcomes.clone(),
                    failures: self.failures.clone(),
                    metrics: self.metrics.snapshot(),
                };
                if !report.failures.is_empty() {
                    self.observer.on_event(&CampaignEvent::FailureSummary {
                        failed: report.failures.len(),
                    });
                }
                self.observer.on_event(&CampaignEvent::Completed {
                    sent: report.metrics.sent,
                    failed: report.metrics.failed,
                    pending: report.metrics.pending,
                });
                Ok(report)
            }
            Err(error) => {
                self.transition(DispatchState::Failed);
                self.observer.on_event(&CampaignEvent::Aborted {
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn dispatch(
        &mut self,
        handle: &mut RelayHandle<C::Session>,
        recipients: &RecipientTable,
    ) -> CampaignResult<CompletionReason> {
        if let crate::config::DispatchMode::Scheduled { at } = self.config.dispatch {
            self.transition(DispatchState::Waiting);
            self.observer
                .on_event(&CampaignEvent::WaitingForSchedule { at });
        }
        let gate = CampaignScheduler::new(self.config.dispatch);
        match gate.wait(self.clock.as_ref(), &self.stop).await {
            GateRelease::Immediate => {}
            GateRelease::AlreadyDue | GateRelease::Reached { .. } => {
                self.observer.on_event(&CampaignEvent::ScheduleReached);
            }
            GateRelease::Stopped => {
                self.observer.on_event(&CampaignEvent::StopRequested);
                return Ok(CompletionReason::Stopped);
            }
        }

        self.transition(DispatchState::Sending);
        let mut governor = ThrottleGovernor::new(self.config.throttle.clone());

        for (index, record) in recipients.records().iter().enumerate() {
            if self.stop.is_stop_requested() {
                self.observer.on_event(&CampaignEvent::StopRequested);
                return Ok(CompletionReason::Stopped);
            }
            if governor.daily_cap_reached() {
                self.observer.on_event(&CampaignEvent::DailyLimitReached {
                    limit: governor.daily_limit(),
                });
                return Ok(CompletionReason::DailyCapReached);
            }

            if let Some(pause) = governor.acquire(index).await {
                self.observer
                    .on_event(&CampaignEvent::ThrottlePause { index, pause });
            }

            let message = self.render(record);
            let retry = self
                .sender
                .send_with_retry(handle, &message, self.observer.as_ref())
                .await;

            let outcome = match retry {
                RetryOutcome::Delivered { attempts } => {
                    let status = self.status_source.status_for(&message);
                    self.metrics.record_sent(status);
                    governor.record_sent();
                    self.observer.on_event(&CampaignEvent::RecipientSent {
                        recipient: message.to.clone(),
                        status,
                    });
                    SendOutcome::Sent { status, attempts }
                }
                RetryOutcome::Rejected { error, .. } if error.is_fatal() => {
                    return Err(error);
                }
                RetryOutcome::Exhausted {
                    attempts,
                    last_error,
                } => {
                    let reason = format!("Failed after {} attempts: {}", attempts, last_error);
                    self.record_failure(&message, attempts, reason)
                }
                RetryOutcome::Rejected { attempts, error } => {
                    self.record_failure(&message, attempts, error.to_string())
                }
            };

            self.outcomes.push(RecipientOutcome {
                index,
                recipient: message.to,
                outcome,
            });
            self.observer
                .on_event(&CampaignEvent::MetricsUpdated(self.metrics.snapshot()));
        }

        Ok(CompletionReason::AllProcessed)
    }

    fn record_failure(&mut self, message: &OutboundMessage, attempts: u32, reason: String) -> SendOutcome {
        self.metrics.record_failed();
        self.failures.record(message.to.clone(), reason.clone());
        self.observer.on_event(&CampaignEvent::RecipientFailed {
            recipient: message.to.clone(),
            attempts,
            error: reason.clone(),
        });
        SendOutcome::Failed { reason, attempts }
    }
}
