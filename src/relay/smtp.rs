//! SMTP submission session over [`TcpTransport`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{RelayConfig, TlsMode};
use crate::errors::{CampaignError, CampaignErrorKind, CampaignResult, ErrorCategory};
use crate::relay::auth::{AuthMethod, Authenticator, Credentials};
use crate::relay::message::{prepare_data_content, OutboundMessage};
use crate::relay::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use crate::relay::transport::{SmtpTransport, TcpTransport};
use crate::relay::{RelayConnector, RelaySession};

/// Opens TCP sessions to the configured relay.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    config: Arc<RelayConfig>,
}

impl SmtpConnector {
    /// Creates a connector for the relay.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl RelayConnector for SmtpConnector {
    type Session = SmtpSession;

    async fn open(&self) -> CampaignResult<SmtpSession> {
        tracing::info!(relay = %self.config.address(), "Connecting to relay");
        let transport = TcpTransport::connect(&self.config).await?;
        Ok(SmtpSession::new(Box::new(transport), Arc::clone(&self.config)))
    }
}

/// One live SMTP session.
#[derive(Debug)]
pub struct SmtpSession {
    transport: Box<dyn SmtpTransport>,
    config: Arc<RelayConfig>,
    capabilities: EsmtpCapabilities,
    authenticated: bool,
    closed: bool,
    out_of_sync: bool,
}

impl SmtpSession {
    /// Wraps a transport whose greeting has already been read.
    pub fn new(transport: Box<dyn SmtpTransport>, config: Arc<RelayConfig>) -> Self {
        Self {
            transport,
            config,
            capabilities: EsmtpCapabilities::default(),
            authenticated: false,
            closed: false,
            out_of_sync: false,
        }
    }

    /// Returns the capabilities from the last EHLO.
    pub fn capabilities(&self) -> &EsmtpCapabilities {
        &self.capabilities
    }

    /// Returns true once the relay accepted the login.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn greet(&mut self) -> CampaignResult<()> {
        let client_id = self.config.client_id().to_string();
        let mut response = self
            .transport
            .send_command(&SmtpCommand::Ehlo(client_id.clone()))
            .await?;

        if !response.is_success() {
            response = self
                .transport
                .send_command(&SmtpCommand::Helo(client_id))
                .await?;
            if !response.is_success() {
                return Err(CampaignError::new(
                    CampaignErrorKind::GreetingRejected,
                    format!("Relay refused greeting: {}", response),
                )
                .with_smtp_code(response.code));
            }
        }

        self.capabilities = EsmtpCapabilities::from_ehlo_response(&response);
        Ok(())
    }

    async fn auth_plain(&mut self, credentials: &Credentials) -> CampaignResult<SmtpResponse> {
        let initial_response =
            Authenticator::plain_initial_response(credentials.username(), credentials.password());
        self.transport
            .send_command(&SmtpCommand::Auth {
                mechanism: AuthMethod::Plain.mechanism_name().to_string(),
                initial_response: Some(initial_response),
            })
            .await
    }

    async fn auth_login(&mut self, credentials: &Credentials) -> CampaignResult<SmtpResponse> {
        let response = self
            .transport
            .send_command(&SmtpCommand::Auth {
                mechanism: AuthMethod::Login.mechanism_name().to_string(),
                initial_response: None,
            })
            .await?;
        if response.code != codes::AUTH_CONTINUE {
            return Ok(response);
        }

        let response = self
            .transport
            .send_command(&SmtpCommand::AuthResponse(Authenticator::login_username(
                credentials.username(),
            )))
            .await?;
        if response.code != codes::AUTH_CONTINUE {
            return Ok(response);
        }

        self.transport
            .send_command(&SmtpCommand::AuthResponse(Authenticator::login_password(
                credentials.password(),
            )))
            .await
    }

    async fn auth_cram_md5(&mut self, credentials: &Credentials) -> CampaignResult<SmtpResponse> {
        let response = self
            .transport
            .send_command(&SmtpCommand::Auth {
                mechanism: AuthMethod::CramMd5.mechanism_name().to_string(),
                initial_response: None,
            })
            .await?;
        if response.code != codes::AUTH_CONTINUE {
            return Ok(response);
        }

        let answer = Authenticator::cram_md5_response(
            response.first_message(),
            credentials.username(),
            credentials.password(),
        )?;
        self.transport
            .send_command(&SmtpCommand::AuthResponse(answer))
            .await
    }

    fn select_method(&self) -> CampaignResult<AuthMethod> {
        let available = self.capabilities.auth_methods();
        if let Some(preferred) = self.config.auth_method {
            return if available.contains(&preferred) {
                Ok(preferred)
            } else {
                Err(CampaignError::new(
                    CampaignErrorKind::AuthMethodNotSupported,
                    format!("Relay does not offer {}", preferred),
                ))
            };
        }
        let allow_cleartext = self.config.tls.mode == TlsMode::None;
        Authenticator::select_best_method(&available, self.transport.is_tls(), allow_cleartext)
    }

    fn lose_session(&mut self, message: &OutboundMessage, error: CampaignError) -> CampaignError {
        self.out_of_sync = true;
        tracing::warn!(recipient = %message.to, error = %error, "Relay session lost mid-transaction");
        CampaignError::new(
            CampaignErrorKind::ConnectionLost,
            format!(
                "Relay session lost while sending to {}; delivery state unknown: {}",
                message.to,
                error.message()
            ),
        )
        .with_cause(error)
    }

    async fn transaction(&mut self, message: &OutboundMessage) -> CampaignResult<()> {
        let response = self
            .transport
            .send_command(&SmtpCommand::MailFrom {
                address: message.envelope_from(),
                body_8bit: self.capabilities.eight_bit_mime,
            })
            .await?;
        if !response.is_success() {
            return Err(response.to_error());
        }

        let response = self
            .transport
            .send_command(&SmtpCommand::RcptTo {
                address: message.envelope_to(),
            })
            .await?;
        if !response.is_success() {
            return Err(response.to_error());
        }

        let response = self.transport.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            return Err(response.to_error());
        }

        let data = prepare_data_content(&message.to_rfc5322());
        if let Some(limit) = self.capabilities.size {
            if data.len() > limit {
                tracing::warn!(size = data.len(), limit, "Message exceeds advertised SIZE");
            }
        }
        self.transport.send_data(&data).await?;

        let response = self.transport.read_response().await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        Ok(())
    }
}

/// A timeout or dropped connection leaves replies unaccounted for, so the
/// stream can no longer be matched to commands.
fn breaks_session(error: &CampaignError) -> bool {
    error.smtp_code().is_none()
        && matches!(
            error.kind(),
            CampaignErrorKind::ReadTimeout
                | CampaignErrorKind::WriteTimeout
                | CampaignErrorKind::ConnectionReset
        )
}

/// Failures while logging in are always fatal to the run.
fn as_auth_error(response: &SmtpResponse) -> CampaignError {
    let error = response.to_error();
    if error.category() == ErrorCategory::Authentication {
        return error;
    }
    CampaignError::new(
        CampaignErrorKind::CredentialsInvalid,
        format!("Authentication failed: {}", response),
    )
    .with_smtp_code(response.code)
}

#[async_trait]
impl RelaySession for SmtpSession {
    async fn secure(&mut self) -> CampaignResult<()> {
        self.greet().await?;

        let mode = self.config.tls.mode;
        if self.transport.is_tls() || matches!(mode, TlsMode::None | TlsMode::Implicit) {
            return Ok(());
        }

        if !self.capabilities.starttls {
            if mode == TlsMode::StartTlsRequired {
                return Err(CampaignError::new(
                    CampaignErrorKind::StarttlsNotSupported,
                    "Relay does not offer STARTTLS",
                ));
            }
            tracing::warn!("Relay does not offer STARTTLS, continuing without TLS");
            return Ok(());
        }

        let response = self.transport.send_command(&SmtpCommand::StartTls).await?;
        if !response.is_success() {
            return Err(CampaignError::new(
                CampaignErrorKind::StarttlsNotSupported,
                format!("STARTTLS refused: {}", response),
            )
            .with_smtp_code(response.code));
        }

        let host = self.config.host.clone();
        let tls = self.config.tls.clone();
        self.transport.upgrade_tls(&tls, &host).await?;
        self.greet().await
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> CampaignResult<()> {
        let method = self.select_method()?;
        tracing::debug!(method = %method, username = %credentials.username(), "Authenticating");

        let response = match method {
            AuthMethod::Plain => self.auth_plain(credentials).await?,
            AuthMethod::Login => self.auth_login(credentials).await?,
            AuthMethod::CramMd5 => self.auth_cram_md5(credentials).await?,
        };

        if response.code != codes::AUTH_SUCCESS {
            return Err(as_auth_error(&response));
        }
        self.authenticated = true;
        Ok(())
    }

    async fn send_one(&mut self, message: &OutboundMessage) -> CampaignResult<()> {
        if self.closed {
            return Err(CampaignError::new(
                CampaignErrorKind::CommandSequenceError,
                "Session is closed",
            ));
        }
        if self.out_of_sync {
            return Err(CampaignError::new(
                CampaignErrorKind::ConnectionLost,
                "Relay session was lost earlier in the run",
            ));
        }
        message.validate()?;

        match self.transaction(message).await {
            Ok(()) => Ok(()),
            Err(error) if breaks_session(&error) => Err(self.lose_session(message, error)),
            Err(error) => {
                if error.smtp_code().is_some() {
                    // leave the session ready for the next recipient
                    if let Err(reset) = self.transport.send_command(&SmtpCommand::Rset).await {
                        tracing::debug!(error = %reset, "RSET after failed transaction failed");
                        if breaks_session(&reset) {
                            self.out_of_sync = true;
                        }
                    }
                }
                Err(error)
            }
        }
    }

    async fn close(&mut self) -> CampaignResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.out_of_sync {
            if let Err(error) = self.transport.send_command(&SmtpCommand::Quit).await {
                tracing::debug!(error = %error, "QUIT failed");
            }
        }
        self.transport.shutdown().await
    }
}
