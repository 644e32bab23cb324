//! Error types for the campaign engine.
//!
//! Every failure carries a [`CampaignErrorKind`], which in turn belongs to one
//! [`ErrorCategory`]. The category decides how the dispatch loop reacts:
//! validation, configuration, connection and authentication errors abort the
//! run; delivery errors are retried per recipient.

use std::fmt;
use thiserror::Error;

/// Result type for campaign operations.
pub type CampaignResult<T> = Result<T, CampaignError>;

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CampaignErrorKind {
    // Input validation
    /// Required input columns are missing.
    MissingColumns,
    /// Input data could not be read or parsed.
    InvalidInput,

    // Configuration
    /// Configuration is invalid.
    ConfigurationInvalid,

    // Connection
    /// DNS resolution or address parsing failed.
    DnsResolution,
    /// Connection was refused.
    ConnectionRefused,
    /// Connection attempt timed out.
    ConnectTimeout,
    /// Relay greeting was missing or negative.
    GreetingRejected,
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS not offered by the relay.
    StarttlsNotSupported,
    /// The session broke mid-run and cannot be reused.
    ConnectionLost,

    // Authentication
    /// Credentials were rejected.
    CredentialsInvalid,
    /// No usable authentication mechanism.
    AuthMethodNotSupported,
    /// Relay requires authentication.
    AuthenticationRequired,

    // Delivery
    /// Relay reported a transient failure (4xx).
    TransientFailure,
    /// Relay is shutting down the service (421).
    ServiceUnavailable,
    /// Relay rejected the recipient permanently.
    RecipientRejected,
    /// Relay rejected the sender permanently.
    SenderRejected,
    /// Message refused for size or content.
    MessageRejected,
    /// Connection dropped mid-transaction.
    ConnectionReset,
    /// Read timed out.
    ReadTimeout,
    /// Write timed out.
    WriteTimeout,

    // Protocol
    /// Malformed reply from the relay.
    InvalidResponse,
    /// Command issued in the wrong session state.
    CommandSequenceError,

    /// Unknown or internal error.
    Unknown,
}

/// Coarse grouping of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input data; the run does not start.
    Validation,
    /// Bad configuration; the run does not start.
    Configuration,
    /// Transport could not be established.
    Connection,
    /// Credentials or mechanism problems.
    Authentication,
    /// A single message could not be delivered.
    Delivery,
    /// The relay spoke something unexpected.
    Protocol,
}

impl CampaignErrorKind {
    /// Returns the category of this kind.
    pub fn category(&self) -> ErrorCategory {
        use CampaignErrorKind::*;
        match self {
            MissingColumns | InvalidInput => ErrorCategory::Validation,
            ConfigurationInvalid => ErrorCategory::Configuration,
            DnsResolution | ConnectionRefused | ConnectTimeout | GreetingRejected
            | TlsHandshakeFailed | StarttlsNotSupported | ConnectionLost => {
                ErrorCategory::Connection
            }
            CredentialsInvalid | AuthMethodNotSupported | AuthenticationRequired => {
                ErrorCategory::Authentication
            }
            TransientFailure | ServiceUnavailable | RecipientRejected | SenderRejected
            | MessageRejected | ConnectionReset | ReadTimeout | WriteTimeout => {
                ErrorCategory::Delivery
            }
            InvalidResponse | CommandSequenceError | Unknown => ErrorCategory::Protocol,
        }
    }

    /// Returns true if this kind is typically retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CampaignErrorKind::TransientFailure
                | CampaignErrorKind::ServiceUnavailable
                | CampaignErrorKind::ConnectionReset
                | CampaignErrorKind::ReadTimeout
                | CampaignErrorKind::WriteTimeout
        )
    }
}

impl fmt::Display for CampaignErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CampaignErrorKind::MissingColumns => "Missing required columns",
            CampaignErrorKind::InvalidInput => "Invalid input data",
            CampaignErrorKind::ConfigurationInvalid => "Invalid configuration",
            CampaignErrorKind::DnsResolution => "DNS resolution failed",
            CampaignErrorKind::ConnectionRefused => "Connection refused",
            CampaignErrorKind::ConnectTimeout => "Connect timeout",
            CampaignErrorKind::GreetingRejected => "Relay greeting rejected",
            CampaignErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            CampaignErrorKind::StarttlsNotSupported => "STARTTLS not supported",
            CampaignErrorKind::ConnectionLost => "Connection lost",
            CampaignErrorKind::CredentialsInvalid => "Invalid credentials",
            CampaignErrorKind::AuthMethodNotSupported => "Auth method not supported",
            CampaignErrorKind::AuthenticationRequired => "Authentication required",
            CampaignErrorKind::TransientFailure => "Transient delivery failure",
            CampaignErrorKind::ServiceUnavailable => "Service unavailable",
            CampaignErrorKind::RecipientRejected => "Recipient rejected",
            CampaignErrorKind::SenderRejected => "Sender rejected",
            CampaignErrorKind::MessageRejected => "Message rejected",
            CampaignErrorKind::ConnectionReset => "Connection reset",
            CampaignErrorKind::ReadTimeout => "Read timeout",
            CampaignErrorKind::WriteTimeout => "Write timeout",
            CampaignErrorKind::InvalidResponse => "Invalid relay response",
            CampaignErrorKind::CommandSequenceError => "Command sequence error",
            CampaignErrorKind::Unknown => "Unknown error",
        };
        f.write_str(text)
    }
}

/// Enhanced mail system status code (RFC 3463).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code such as `"5.1.1"`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let code = Self {
            class: parts.next()?.parse().ok()?,
            subject: parts.next()?.parse().ok()?,
            detail: parts.next()?.parse().ok()?,
        };
        if parts.next().is_some() || !(2..=5).contains(&code.class) {
            return None;
        }
        Some(code)
    }

    /// Returns true if this is a temporary failure.
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Campaign error with detailed information.
#[derive(Error, Debug)]
pub struct CampaignError {
    kind: CampaignErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CampaignError {
    /// Creates a new error.
    pub fn new(kind: CampaignErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> CampaignErrorKind {
        self.kind
    }

    /// Returns the error category.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if a delivery attempt failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return (400..500).contains(&code);
        }
        self.kind.is_retryable()
    }

    /// Returns true if this error aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation
                | ErrorCategory::Configuration
                | ErrorCategory::Connection
                | ErrorCategory::Authentication
        )
    }

    // Convenience constructors

    /// Creates a missing-columns validation error.
    pub fn missing_columns(columns: &[&str]) -> Self {
        Self::new(CampaignErrorKind::MissingColumns, columns.join(", "))
    }

    /// Creates an input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::InvalidInput, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::ConnectionRefused, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::CredentialsInvalid, message)
    }

    /// Creates a transient delivery error.
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::TransientFailure, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(CampaignErrorKind::InvalidResponse, message)
    }

    /// Creates an error from a negative relay reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => CampaignErrorKind::ServiceUnavailable,
            450..=499 => CampaignErrorKind::TransientFailure,
            500..=504 => CampaignErrorKind::InvalidResponse,
            530 => CampaignErrorKind::AuthenticationRequired,
            534 | 535 => CampaignErrorKind::CredentialsInvalid,
            550 | 551 => CampaignErrorKind::RecipientRejected,
            553 => CampaignErrorKind::SenderRejected,
            552 | 554 => CampaignErrorKind::MessageRejected,
            _ => CampaignErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for CampaignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

impl From<csv::Error> for CampaignError {
    fn from(error: csv::Error) -> Self {
        CampaignError::invalid_input(format!("Error reading CSV data: {}", error)).with_cause(error)
    }
}

impl From<toml::de::Error> for CampaignError {
    fn from(error: toml::de::Error) -> Self {
        CampaignError::configuration(format!("Invalid configuration file: {}", error))
            .with_cause(error)
    }
}
