//! Relay connection management.
//!
//! A campaign run owns exactly one relay session. [`RelayConnectionManager`]
//! opens it, negotiates TLS and logs in; if any of those steps fails the
//! session is closed before the error is returned. The caller receives a
//! [`RelayHandle`] whose `close` is idempotent.

pub mod auth;
pub mod message;
pub mod protocol;
pub mod smtp;
pub mod transport;

use async_trait::async_trait;

use crate::errors::{CampaignError, CampaignErrorKind, CampaignResult};

pub use auth::{AuthMethod, Credentials};
pub use message::OutboundMessage;
pub use smtp::{SmtpConnector, SmtpSession};

/// Opens transport-level sessions to a relay.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Session type produced by this connector.
    type Session: RelaySession;

    /// Opens the connection and reads the greeting.
    async fn open(&self) -> CampaignResult<Self::Session>;
}

/// A single stateful relay session.
#[async_trait]
pub trait RelaySession: Send {
    /// Greets the relay and negotiates transport security.
    async fn secure(&mut self) -> CampaignResult<()>;

    /// Logs in.
    async fn authenticate(&mut self, credentials: &Credentials) -> CampaignResult<()>;

    /// Submits one message.
    async fn send_one(&mut self, message: &OutboundMessage) -> CampaignResult<()>;

    /// Ends the session.
    async fn close(&mut self) -> CampaignResult<()>;
}

/// Opens authenticated sessions.
pub struct RelayConnectionManager<C> {
    connector: C,
    credentials: Option<Credentials>,
}

impl<C: RelayConnector> RelayConnectionManager<C> {
    /// Creates a manager. Without credentials the login step is skipped.
    pub fn new(connector: C, credentials: Option<Credentials>) -> Self {
        Self {
            connector,
            credentials,
        }
    }

    /// Opens, secures and authenticates a session.
    ///
    /// Errors from this call are connection or authentication failures and
    /// abort the run. The session is already closed when they are returned.
    pub async fn connect(&self) -> CampaignResult<RelayHandle<C::Session>> {
        let mut session = self.connector.open().await.map_err(as_connection_error)?;

        match self.prepare(&mut session).await {
            Ok(()) => Ok(RelayHandle::new(session)),
            Err(error) => {
                if let Err(close_error) = session.close().await {
                    tracing::debug!(error = %close_error, "Close after failed connect failed");
                }
                Err(error)
            }
        }
    }

    async fn prepare(&self, session: &mut C::Session) -> CampaignResult<()> {
        session.secure().await.map_err(as_connection_error)?;
        if let Some(credentials) = &self.credentials {
            session
                .authenticate(credentials)
                .await
                .map_err(as_connection_error)?;
            tracing::info!(username = %credentials.username(), "Authenticated with relay");
        }
        Ok(())
    }
}

/// Anything going wrong before or during the login that is not already
/// fatal (a rejected login is) becomes a connection failure.
fn as_connection_error(error: CampaignError) -> CampaignError {
    if error.is_fatal() {
        return error;
    }
    let mut mapped = CampaignError::new(
        CampaignErrorKind::ConnectionRefused,
        format!("Relay connection failed: {}", error.message()),
    );
    if let Some(code) = error.smtp_code() {
        mapped = mapped.with_smtp_code(code);
    }
    mapped.with_cause(error)
}

/// Owner of the open session.
pub struct RelayHandle<S: RelaySession> {
    session: Option<S>,
}

impl<S: RelaySession> RelayHandle<S> {
    fn new(session: S) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Returns true until `close` has been called.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Submits one message over the session.
    pub async fn send_one(&mut self, message: &OutboundMessage) -> CampaignResult<()> {
        match self.session.as_mut() {
            Some(session) => session.send_one(message).await,
            None => Err(CampaignError::new(
                CampaignErrorKind::CommandSequenceError,
                "Relay session already closed",
            )),
        }
    }

    /// Closes the session. Later calls are no-ops.
    pub async fn close(&mut self) -> CampaignResult<()> {
        match self.session.take() {
            Some(mut session) => session.close().await,
            None => Ok(()),
        }
    }
}

impl<S: RelaySession> Drop for RelayHandle<S> {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::warn!("Relay session dropped without close");
        }
    }
}
