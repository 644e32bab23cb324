//! Line-oriented transport for the relay session.
//!
//! TCP with optional TLS (implicit or upgraded via STARTTLS). Every read and
//! write is bounded by the command timeout.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{RelayConfig, TlsConfig, TlsMode};
use crate::errors::{CampaignError, CampaignErrorKind, CampaignResult};
use crate::relay::protocol::{SmtpCommand, SmtpResponse};

/// Byte-level seam between the SMTP session and the network.
#[async_trait]
pub trait SmtpTransport: Send + fmt::Debug {
    /// Sends a command and reads the reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> CampaignResult<SmtpResponse>;

    /// Writes raw bytes (the DATA payload).
    async fn send_data(&mut self, data: &[u8]) -> CampaignResult<()>;

    /// Reads one (possibly multiline) reply.
    async fn read_response(&mut self) -> CampaignResult<SmtpResponse>;

    /// Upgrades the plain connection to TLS.
    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> CampaignResult<()>;

    /// Returns true once TLS is active.
    fn is_tls(&self) -> bool;

    /// Drops the underlying stream.
    async fn shutdown(&mut self) -> CampaignResult<()>;
}

enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(BufReader<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    /// `None` after shutdown or during a TLS upgrade.
    stream: Option<TransportStream>,
    command_timeout: Duration,
    tls_enabled: bool,
    host: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("tls_enabled", &self.tls_enabled)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl TcpTransport {
    /// Connects to the relay and consumes its greeting.
    pub async fn connect(config: &RelayConfig) -> CampaignResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                CampaignError::new(
                    CampaignErrorKind::ConnectTimeout,
                    format!("Connect to {} timed out", address),
                )
            })?
            .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: Some(TransportStream::Plain(BufReader::new(stream))),
            command_timeout: config.command_timeout,
            tls_enabled: false,
            host: config.host.clone(),
        };

        if config.tls.mode == TlsMode::Implicit {
            transport.upgrade_tls(&config.tls, &config.host).await?;
        }

        let greeting = transport.read_response().await?;
        if greeting.code != crate::relay::protocol::codes::SERVICE_READY {
            return Err(CampaignError::new(
                CampaignErrorKind::GreetingRejected,
                format!("Relay greeting: {}", greeting),
            )
            .with_smtp_code(greeting.code));
        }

        Ok(transport)
    }

    fn map_io_error(error: io::Error, address: &str) -> CampaignError {
        let kind = match error.kind() {
            io::ErrorKind::ConnectionRefused => CampaignErrorKind::ConnectionRefused,
            io::ErrorKind::TimedOut => CampaignErrorKind::ConnectTimeout,
            io::ErrorKind::InvalidInput | io::ErrorKind::NotFound => {
                CampaignErrorKind::DnsResolution
            }
            _ => CampaignErrorKind::ConnectionRefused,
        };
        CampaignError::new(kind, format!("Cannot connect to {}: {}", address, error))
            .with_cause(error)
    }

    fn stream_mut(&mut self) -> CampaignResult<&mut TransportStream> {
        self.stream.as_mut().ok_or_else(|| {
            CampaignError::new(CampaignErrorKind::ConnectionReset, "Connection is closed")
        })
    }

    async fn read_lines<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> CampaignResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| CampaignError::new(CampaignErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| {
                    CampaignError::new(CampaignErrorKind::ConnectionReset, format!("Read error: {}", e))
                })?;

            if read == 0 {
                return Err(CampaignError::new(
                    CampaignErrorKind::ConnectionReset,
                    "Relay closed the connection",
                ));
            }

            let line = line.trim_end().to_string();
            // "250-..." continues, "250 ..." ends the reply
            let continues = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !continues {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> CampaignResult<()> {
        timeout(timeout_duration, async {
            writer.write_all(data).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| CampaignError::new(CampaignErrorKind::WriteTimeout, "Write timed out"))?
        .map_err(|e| {
            CampaignError::new(CampaignErrorKind::ConnectionReset, format!("Write error: {}", e))
        })
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> CampaignResult<SmtpResponse> {
        let line = format!("{}\r\n", command.to_smtp_string());
        tracing::debug!(command = %command, "Sending SMTP command");
        self.send_data(line.as_bytes()).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> CampaignResult<()> {
        let command_timeout = self.command_timeout;
        match self.stream_mut()? {
            TransportStream::Plain(stream) => {
                Self::write_all(stream.get_mut(), data, command_timeout).await
            }
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => {
                Self::write_all(stream.get_mut(), data, command_timeout).await
            }
        }
    }

    async fn read_response(&mut self) -> CampaignResult<SmtpResponse> {
        let command_timeout = self.command_timeout;
        let response = match self.stream_mut()? {
            TransportStream::Plain(stream) => Self::read_lines(stream, command_timeout).await?,
            #[cfg(feature = "rustls-tls")]
            TransportStream::Tls(stream) => Self::read_lines(stream, command_timeout).await?,
        };

        tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");
        Ok(response)
    }

    #[cfg(feature = "rustls-tls")]
    async fn upgrade_tls(&mut self, config: &TlsConfig, host: &str) -> CampaignResult<()> {
        use rustls::pki_types::ServerName;
        use std::sync::Arc;

        if self.tls_enabled {
            return Ok(());
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let name = config.sni_override.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| CampaignError::tls(format!("Invalid server name: {}", name)))?;

        let tcp_stream = match self.stream.take() {
            Some(TransportStream::Plain(reader)) => reader.into_inner(),
            Some(other) => {
                self.stream = Some(other);
                return Err(CampaignError::tls("Connection already uses TLS"));
            }
            None => {
                return Err(CampaignError::new(
                    CampaignErrorKind::ConnectionReset,
                    "Connection is closed",
                ))
            }
        };

        let tls_stream = timeout(self.command_timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| CampaignError::tls("TLS handshake timed out"))?
            .map_err(|e| CampaignError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        self.stream = Some(TransportStream::Tls(BufReader::new(tls_stream)));
        self.tls_enabled = true;
        tracing::debug!(host = %self.host, "TLS established");
        Ok(())
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn upgrade_tls(&mut self, _config: &TlsConfig, _host: &str) -> CampaignResult<()> {
        Err(CampaignError::configuration(
            "TLS requested but the crate was built without the rustls-tls feature",
        ))
    }

    fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    async fn shutdown(&mut self) -> CampaignResult<()> {
        match self.stream.take() {
            Some(TransportStream::Plain(mut stream)) => {
                stream.get_mut().shutdown().await.ok();
            }
            #[cfg(feature = "rustls-tls")]
            Some(TransportStream::Tls(mut stream)) => {
                stream.get_mut().shutdown().await.ok();
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..RelayConfig::default()
        };
        let err = TcpTransport::connect(&config).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_negative_greeting_rejected() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"554 No service\r\n").await.unwrap();
        });

        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port,
            tls: TlsConfig {
                mode: TlsMode::None,
                sni_override: None,
            },
            ..RelayConfig::default()
        };
        let err = TcpTransport::connect(&config).await.unwrap_err();
        assert_eq!(err.kind(), CampaignErrorKind::GreetingRejected);
        assert_eq!(err.smtp_code(), Some(554));
    }
}
