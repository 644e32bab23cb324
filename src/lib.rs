//! # SMTP Campaign Dispatcher
//!
//! Sends one personalized plain-text message per row of a recipient table
//! over a single authenticated SMTP relay session, with:
//! - `{Column}` placeholder rendering from CSV rows
//! - STARTTLS or implicit TLS and PLAIN, LOGIN or CRAM-MD5 login
//! - Per-window throttling and a per-run volume cap
//! - Bounded exponential-backoff retry of transient failures
//! - An optional time-of-day start gate
//! - Live metrics and a JSON failure ledger
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_smtp_campaign::{CampaignConfig, CampaignDispatcher, RecipientTable};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CampaignConfig::builder()
//!         .sender("sender@example.com")
//!         .password("app-password")
//!         .subject("Hello from Example")
//!         .template("Dear {Contact Person}, news for {Company Name}.")
//!         .build()?;
//!
//!     let recipients = RecipientTable::from_path("recipients.csv")?;
//!     let mut dispatcher = CampaignDispatcher::smtp(config)?;
//!     let report = dispatcher.run(&recipients).await?;
//!
//!     println!("{}", report.metrics);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Input
pub mod recipients;
pub mod template;

// Relay session
pub mod relay;

// Pacing
pub mod resilience;
pub mod scheduler;

// Reporting
pub mod metrics;
pub mod observability;
pub mod tracking;

// Dispatch
pub mod campaign;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use campaign::{
    CampaignDispatcher, CampaignReport, CompletionReason, DispatchState, FailureLedger,
    FailureRecord, RecipientOutcome, SendOutcome, StopHandle,
};
pub use config::{
    CampaignConfig, CampaignConfigBuilder, DispatchMode, RelayConfig, RetryConfig,
    ThrottleConfig, ThrottlePolicy, TlsConfig, TlsMode,
};
pub use errors::{CampaignError, CampaignErrorKind, CampaignResult, ErrorCategory};
pub use metrics::{CampaignMetrics, MetricsSnapshot};
pub use observability::{CampaignEvent, CampaignObserver, EventLevel, TracingObserver};
pub use recipients::{RecipientRecord, RecipientTable};
pub use relay::{
    AuthMethod, Credentials, OutboundMessage, RelayConnectionManager, RelayConnector,
    RelayHandle, RelaySession, SmtpConnector, SmtpSession,
};
pub use resilience::{BackoffSender, RetryOutcome, ThrottleGovernor};
pub use scheduler::{CampaignScheduler, GateRelease, SystemClock, WallClock};
pub use template::MessageTemplate;
pub use tracking::{DeliveryStatus, DeliveryStatusSource, SimulatedStatusSource};
