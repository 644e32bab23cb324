//! Mock implementations for testing.
//!
//! Provides mock relays, observers and fixtures for London-School TDD.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use secrecy::SecretString;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{
    CampaignConfig, DispatchMode, RelayConfig, RetryConfig, ThrottleConfig, TlsConfig, TlsMode,
};
use crate::errors::{CampaignError, CampaignErrorKind, CampaignResult};
use crate::observability::{CampaignEvent, CampaignObserver};
use crate::recipients::RecipientTable;
use crate::relay::auth::Credentials;
use crate::relay::protocol::{SmtpCommand, SmtpResponse};
use crate::relay::transport::SmtpTransport;
use crate::relay::{OutboundMessage, RelayConnector, RelaySession};
use crate::scheduler::WallClock;
use crate::tracking::{DeliveryStatus, DeliveryStatusSource};

/// Transport that replays queued replies and records what was sent.
#[derive(Debug)]
pub struct ScriptedTransport {
    responses: VecDeque<SmtpResponse>,
    commands: Arc<Mutex<Vec<String>>>,
    data: Arc<Mutex<Vec<Vec<u8>>>>,
    tls_enabled: bool,
}

impl ScriptedTransport {
    /// Creates a transport answering with `responses` in order.
    pub fn new(responses: Vec<SmtpResponse>) -> Self {
        Self {
            responses: responses.into(),
            commands: Arc::new(Mutex::new(Vec::new())),
            data: Arc::new(Mutex::new(Vec::new())),
            tls_enabled: false,
        }
    }

    /// Shared log of command lines sent.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.commands)
    }

    /// Shared log of DATA payloads sent.
    pub fn data(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.data)
    }

    fn next_response(&mut self) -> CampaignResult<SmtpResponse> {
        self.responses.pop_front().ok_or_else(|| {
            CampaignError::new(CampaignErrorKind::ConnectionReset, "Script exhausted")
        })
    }
}

#[async_trait]
impl SmtpTransport for ScriptedTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> CampaignResult<SmtpResponse> {
        self.commands.lock().unwrap().push(command.to_smtp_string());
        self.next_response()
    }

    async fn send_data(&mut self, data: &[u8]) -> CampaignResult<()> {
        self.data.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn read_response(&mut self) -> CampaignResult<SmtpResponse> {
        self.next_response()
    }

    async fn upgrade_tls(&mut self, _config: &TlsConfig, _host: &str) -> CampaignResult<()> {
        self.tls_enabled = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn shutdown(&mut self) -> CampaignResult<()> {
        Ok(())
    }
}

/// Scripted behavior for [`MockConnector`].
#[derive(Debug, Clone, Default)]
pub struct MockRelayBehavior {
    /// Refuse the connection.
    pub fail_open: bool,
    /// Fail the TLS negotiation.
    pub fail_secure: bool,
    /// Reject the login.
    pub fail_auth: bool,
    /// Drop the connection during the login.
    pub drop_during_auth: bool,
    /// Transient failures to return before accepting, per recipient.
    pub transient: HashMap<String, u32>,
    /// Recipients that always fail transiently.
    pub always_transient: HashSet<String>,
    /// Recipients rejected permanently.
    pub permanent: HashSet<String>,
    /// Recipients whose send fails with a fatal error.
    pub fatal: HashSet<String>,
}

impl MockRelayBehavior {
    /// `recipient` fails transiently `count` times, then succeeds.
    pub fn transient_failures(mut self, recipient: &str, count: u32) -> Self {
        self.transient.insert(recipient.to_string(), count);
        self
    }

    /// `recipient` never succeeds.
    pub fn always_transient(mut self, recipient: &str) -> Self {
        self.always_transient.insert(recipient.to_string());
        self
    }

    /// `recipient` is rejected with a 550.
    pub fn permanent_failure(mut self, recipient: &str) -> Self {
        self.permanent.insert(recipient.to_string());
        self
    }

    /// Sending to `recipient` fails with a 530 (session lost its login).
    pub fn fatal_failure(mut self, recipient: &str) -> Self {
        self.fatal.insert(recipient.to_string());
        self
    }
}

/// Counters and records shared by a connector and its sessions.
#[derive(Debug, Default)]
pub struct MockRelayState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    auth_attempts: AtomicUsize,
    sent: Mutex<Vec<OutboundMessage>>,
    attempts: Mutex<Vec<(String, Instant)>>,
    remaining_transient: Mutex<HashMap<String, u32>>,
}

impl MockRelayState {
    /// Sessions opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Calls to `close`, over all sessions.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Login attempts.
    pub fn auth_attempts(&self) -> usize {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    /// Messages accepted, in order.
    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Send attempts made for `recipient`.
    pub fn attempts_for(&self, recipient: &str) -> usize {
        self.attempt_times(recipient).len()
    }

    /// Instants at which `recipient` was attempted.
    pub fn attempt_times(&self, recipient: &str) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Total send attempts.
    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

/// Connector producing [`MockSession`]s.
#[derive(Debug)]
pub struct MockConnector {
    behavior: MockRelayBehavior,
    state: Arc<MockRelayState>,
}

impl MockConnector {
    /// Creates a connector with the given behavior.
    pub fn new(behavior: MockRelayBehavior) -> Self {
        let state = MockRelayState {
            remaining_transient: Mutex::new(behavior.transient.clone()),
            ..MockRelayState::default()
        };
        Self {
            behavior,
            state: Arc::new(state),
        }
    }

    /// Shared state for assertions.
    pub fn state(&self) -> Arc<MockRelayState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    type Session = MockSession;

    async fn open(&self) -> CampaignResult<MockSession> {
        if self.behavior.fail_open {
            return Err(CampaignError::new(
                CampaignErrorKind::ConnectionRefused,
                "Connection refused by mock relay",
            ));
        }
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            behavior: self.behavior.clone(),
            state: Arc::clone(&self.state),
        })
    }
}

/// In-memory relay session.
#[derive(Debug)]
pub struct MockSession {
    behavior: MockRelayBehavior,
    state: Arc<MockRelayState>,
}

#[async_trait]
impl RelaySession for MockSession {
    async fn secure(&mut self) -> CampaignResult<()> {
        if self.behavior.fail_secure {
            return Err(CampaignError::tls("Mock TLS handshake failed"));
        }
        Ok(())
    }

    async fn authenticate(&mut self, _credentials: &Credentials) -> CampaignResult<()> {
        self.state.auth_attempts.fetch_add(1, Ordering::SeqCst);
        if self.behavior.drop_during_auth {
            return Err(CampaignError::new(
                CampaignErrorKind::ConnectionReset,
                "Relay closed the connection",
            ));
        }
        if self.behavior.fail_auth {
            return Err(CampaignError::from_smtp_response(
                535,
                "5.7.8 Username and Password not accepted",
            ));
        }
        Ok(())
    }

    async fn send_one(&mut self, message: &OutboundMessage) -> CampaignResult<()> {
        self.state
            .attempts
            .lock()
            .unwrap()
            .push((message.to.clone(), Instant::now()));

        let to = message.to.as_str();
        if self.behavior.fatal.contains(to) {
            return Err(CampaignError::from_smtp_response(530, "Authentication required"));
        }
        if self.behavior.permanent.contains(to) {
            return Err(CampaignError::from_smtp_response(550, "No such user"));
        }
        if self.behavior.always_transient.contains(to) {
            return Err(CampaignError::from_smtp_response(451, "Try again later"));
        }
        {
            let mut remaining = self.state.remaining_transient.lock().unwrap();
            if let Some(count) = remaining.get_mut(to) {
                if *count > 0 {
                    *count -= 1;
                    return Err(CampaignError::from_smtp_response(451, "Try again later"));
                }
            }
        }

        self.state.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&mut self) -> CampaignResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<CampaignEvent>>,
}

impl RecordingObserver {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far.
    pub fn events(&self) -> Vec<CampaignEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event texts so far.
    pub fn messages(&self) -> Vec<String> {
        self.events().iter().map(ToString::to_string).collect()
    }

    /// Delays announced by retry warnings, in order.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CampaignEvent::RetryScheduled { delay, .. } => Some(delay),
                _ => None,
            })
            .collect()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&CampaignEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl CampaignObserver for RecordingObserver {
    fn on_event(&self, event: &CampaignEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Status source that always answers the same.
#[derive(Debug, Clone, Copy)]
pub struct FixedStatusSource {
    status: DeliveryStatus,
}

impl FixedStatusSource {
    /// Always reports `status`.
    pub fn new(status: DeliveryStatus) -> Self {
        Self { status }
    }
}

impl DeliveryStatusSource for FixedStatusSource {
    fn status_for(&mut self, _message: &OutboundMessage) -> DeliveryStatus {
        self.status
    }
}

/// Wall clock that follows tokio's (pausable) clock from a fixed start.
#[derive(Debug, Clone, Copy)]
pub struct MockClock {
    start: NaiveDateTime,
    origin: Instant,
}

impl MockClock {
    /// Reads `start` now and advances with tokio time.
    pub fn starting_at(start: NaiveDateTime) -> Self {
        Self {
            start,
            origin: Instant::now(),
        }
    }
}

impl WallClock for MockClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.start + elapsed
    }
}

/// Creates a valid configuration for tests: plain loopback relay, 5 s backoff base.
pub fn test_config() -> CampaignConfig {
    CampaignConfig {
        sender: "sender@example.com".to_string(),
        relay: RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 2525,
            tls: TlsConfig {
                mode: TlsMode::None,
                sni_override: None,
            },
            password: Some(SecretString::new("secret".to_string())),
            ..RelayConfig::default()
        },
        subject: "Hello from Example".to_string(),
        template: "Dear {Contact Person},\n\nNews for {Company Name}.".to_string(),
        dispatch: DispatchMode::Immediately,
        throttle: ThrottleConfig::default(),
        retry: RetryConfig::default(),
    }
}

/// Creates a table with `count` recipients:
/// `Company i`, `contact{i}@company{i}.test`, `Person i`.
pub fn recipient_table(count: usize) -> RecipientTable {
    let rows: Vec<Vec<String>> = (0..count)
        .map(|i| {
            vec![
                format!("Company {}", i),
                format!("contact{}@company{}.test", i, i),
                format!("Person {}", i),
            ]
        })
        .collect();
    RecipientTable::from_rows(["Company Name", "Email", "Contact Person"], rows)
        .unwrap_or_default()
}

/// Recipient address used by [`recipient_table`] for row `i`.
pub fn recipient_email(i: usize) -> String {
    format!("contact{}@company{}.test", i, i)
}

/// EHLO reply advertising the given extensions.
pub fn ehlo_response(extensions: &[&str]) -> SmtpResponse {
    let mut message = vec!["relay.example.com".to_string()];
    message.extend(extensions.iter().map(|e| e.to_string()));
    SmtpResponse {
        code: 250,
        enhanced_code: None,
        message,
    }
}
