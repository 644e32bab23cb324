//! Configuration types for a campaign run.
//!
//! Provides configuration with builder pattern for:
//! - Relay connection settings and credentials
//! - TLS configuration
//! - Dispatch mode (immediate or scheduled)
//! - Throttling and daily volume cap
//! - Retry with exponential backoff
//!
//! A configuration is immutable for the duration of one run.

use chrono::NaiveTime;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{CampaignError, CampaignResult};
use crate::relay::auth::{AuthMethod, Credentials};

/// Default SMTP submission port (STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default relay host.
pub const DEFAULT_HOST: &str = "smtp.gmail.com";

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default subject line.
pub const DEFAULT_SUBJECT: &str = "Hello from [Your Company]";

/// Default message template.
pub const DEFAULT_TEMPLATE: &str = "Dear {Contact Person},\n\nWe would like to inform you about our latest product offerings for {Company Name} located in {Location}.";

/// Environment variable consulted for the relay password.
pub const PASSWORD_ENV: &str = "SMTP_PASSWORD";

/// Accepted range for messages per minute.
pub const RATE_LIMIT_RANGE: (u32, u32) = (1, 60);

/// Accepted range for messages per day.
pub const DAILY_LIMIT_RANGE: (u32, u32) = (1, 500);

/// TLS mode for the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS (loopback relays and tests only).
    None,
    /// Use STARTTLS when the relay offers it (default).
    #[default]
    StartTls,
    /// Require STARTTLS, fail otherwise.
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Server Name Indication override.
    #[serde(default)]
    pub sni_override: Option<String>,
}

/// Relay endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay hostname.
    #[serde(default = "default_host")]
    pub host: String,
    /// Relay port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Login name; defaults to the sender address.
    #[serde(default)]
    pub username: Option<String>,
    /// Password (never serialized).
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Preferred authentication method.
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_host() -> String { DEFAULT_HOST.to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: TlsConfig::default(),
            username: None,
            password: None,
            auth_method: None,
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
            client_id: None,
        }
    }
}

impl RelayConfig {
    /// Returns the `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }

    /// Returns the login credentials, if a password is configured.
    pub fn credentials(&self, sender: &str) -> Option<Credentials> {
        let password = self.password.clone()?;
        let username = self.username.clone().unwrap_or_else(|| sender.to_string());
        Some(Credentials::new(username, password))
    }

    fn validate(&self) -> CampaignResult<()> {
        if self.host.trim().is_empty() {
            return Err(CampaignError::configuration("Relay host is required"));
        }
        if self.port == 0 {
            return Err(CampaignError::configuration("Relay port must be non-zero"));
        }
        Ok(())
    }
}

/// When dispatch begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// Start as soon as the relay session is open.
    #[default]
    Immediately,
    /// Wait until this time of day (today) before sending.
    Scheduled {
        /// Local time of day.
        at: NaiveTime,
    },
}

/// How the per-minute rate is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlePolicy {
    /// Pause a full window after every `rate_limit` recipients, by index.
    #[default]
    FixedWindow,
    /// Pause only for what remains of the window since the batch started.
    ElapsedWindow,
}

/// Throttle and volume cap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Messages per window.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// Maximum messages sent per run.
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// Window length.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    /// Window enforcement policy.
    #[serde(default)]
    pub policy: ThrottlePolicy,
}

fn default_rate_limit() -> u32 { 10 }
fn default_daily_limit() -> u32 { 100 }
fn default_window() -> Duration { Duration::from_secs(60) }

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            daily_limit: default_daily_limit(),
            window: default_window(),
            policy: ThrottlePolicy::default(),
        }
    }
}

impl ThrottleConfig {
    fn validate(&self) -> CampaignResult<()> {
        let (min, max) = RATE_LIMIT_RANGE;
        if !(min..=max).contains(&self.rate_limit) {
            return Err(CampaignError::configuration(format!(
                "rate_limit must be between {} and {} emails per minute, got {}",
                min, max, self.rate_limit
            )));
        }
        let (min, max) = DAILY_LIMIT_RANGE;
        if !(min..=max).contains(&self.daily_limit) {
            return Err(CampaignError::configuration(format!(
                "daily_limit must be between {} and {} emails per day, got {}",
                min, max, self.daily_limit
            )));
        }
        if self.window.is_zero() {
            return Err(CampaignError::configuration("throttle window must be non-zero"));
        }
        Ok(())
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum send attempts per recipient.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> Duration { Duration::from_secs(5) }
fn default_max_delay() -> Duration { Duration::from_secs(300) }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> CampaignResult<()> {
        if self.max_attempts == 0 {
            return Err(CampaignError::configuration("max_attempts must be at least 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(CampaignError::configuration(
                "max_delay cannot be shorter than base_delay",
            ));
        }
        Ok(())
    }
}

/// Full configuration of one campaign run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Sender address, used for `From` and as default login.
    pub sender: String,
    /// Relay settings.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Subject line.
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Message body template with `{Column}` placeholders.
    #[serde(default = "default_template")]
    pub template: String,
    /// Dispatch mode.
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Throttle settings.
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_subject() -> String { DEFAULT_SUBJECT.to_string() }
fn default_template() -> String { DEFAULT_TEMPLATE.to_string() }

impl CampaignConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> CampaignConfigBuilder {
        CampaignConfigBuilder::default()
    }

    /// Parses a TOML document. The password is taken from [`PASSWORD_ENV`]
    /// when the document does not carry one.
    pub fn from_toml_str(document: &str) -> CampaignResult<Self> {
        let mut config: CampaignConfig = toml::from_str(document)?;
        if config.relay.password.is_none() {
            config.relay.password = std::env::var(PASSWORD_ENV).ok().map(SecretString::new);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> CampaignResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|e| {
            CampaignError::configuration(format!("Cannot read {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        Self::from_toml_str(&document)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> CampaignResult<()> {
        if self.sender.trim().is_empty() {
            return Err(CampaignError::configuration("Sender address is required"));
        }
        if !self.sender.contains('@') {
            return Err(CampaignError::configuration(format!(
                "Sender address '{}' is not an email address",
                self.sender
            )));
        }
        if self.template.is_empty() {
            return Err(CampaignError::configuration("Message template is empty"));
        }
        self.relay.validate()?;
        self.throttle.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Returns the relay login credentials, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        self.relay.credentials(&self.sender)
    }
}

/// Builder for campaign configuration.
#[derive(Debug, Default)]
pub struct CampaignConfigBuilder {
    sender: Option<String>,
    relay: RelayConfig,
    subject: Option<String>,
    template: Option<String>,
    dispatch: DispatchMode,
    throttle: ThrottleConfig,
    retry: RetryConfig,
}

impl CampaignConfigBuilder {
    /// Sets the sender address.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the relay host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.relay.host = host.into();
        self
    }

    /// Sets the relay port.
    pub fn port(mut self, port: u16) -> Self {
        self.relay.port = port;
        self
    }

    /// Sets the relay password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.relay.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets a login name different from the sender address.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.relay.username = Some(username.into());
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.relay.tls.mode = mode;
        self
    }

    /// Sets the relay command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.relay.command_timeout = timeout;
        self
    }

    /// Sets the subject line.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the message template.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Sends as soon as the session is open.
    pub fn immediately(mut self) -> Self {
        self.dispatch = DispatchMode::Immediately;
        self
    }

    /// Waits for the given time of day before sending.
    pub fn scheduled_at(mut self, at: NaiveTime) -> Self {
        self.dispatch = DispatchMode::Scheduled { at };
        self
    }

    /// Sets messages per minute.
    pub fn rate_limit(mut self, per_minute: u32) -> Self {
        self.throttle.rate_limit = per_minute;
        self
    }

    /// Sets messages per day.
    pub fn daily_limit(mut self, per_day: u32) -> Self {
        self.throttle.daily_limit = per_day;
        self
    }

    /// Sets the throttle policy.
    pub fn throttle_policy(mut self, policy: ThrottlePolicy) -> Self {
        self.throttle.policy = policy;
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> CampaignResult<CampaignConfig> {
        let config = CampaignConfig {
            sender: self
                .sender
                .ok_or_else(|| CampaignError::configuration("Sender address is required"))?,
            relay: self.relay,
            subject: self.subject.unwrap_or_else(default_subject),
            template: self.template.unwrap_or_else(default_template),
            dispatch: self.dispatch,
            throttle: self.throttle,
            retry: self.retry,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
