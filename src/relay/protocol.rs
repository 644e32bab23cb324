//! SMTP submission protocol pieces used by the relay session.
//!
//! Commands, reply parsing (RFC 5321 §4.2) and EHLO capability discovery.

use std::collections::HashSet;
use std::fmt;

use crate::errors::{CampaignError, CampaignResult, EnhancedStatusCode};
use crate::relay::auth::AuthMethod;

/// SMTP commands issued by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Mechanism name.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// Bare continuation line of a SASL exchange.
    AuthResponse(String),
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, angle-bracketed.
        address: String,
        /// 8BITMIME parameter.
        body_8bit: bool,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address, angle-bracketed.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command line without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::AuthResponse(response) => response.clone(),
            SmtpCommand::MailFrom { address, body_8bit } => {
                if *body_8bit {
                    format!("MAIL FROM:{} BODY=8BITMIME", address)
                } else {
                    format!("MAIL FROM:{}", address)
                }
            }
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns true if the command line carries secret material.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, SmtpCommand::Auth { .. } | SmtpCommand::AuthResponse(_))
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth { mechanism, .. } => write!(f, "AUTH {} ****", mechanism),
            SmtpCommand::AuthResponse(_) => f.write_str("****"),
            other => f.write_str(&other.to_smtp_string()),
        }
    }
}

/// Reply from the relay.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Reply code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code, if present.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text lines.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Parses a reply from raw lines (CRLF already stripped).
    pub fn parse(lines: &[String]) -> CampaignResult<Self> {
        if lines.is_empty() {
            return Err(CampaignError::protocol("Empty response"));
        }

        let mut code = 0u16;
        let mut enhanced_code = None;
        let mut messages = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            let parsed: u16 = line
                .get(..3)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| CampaignError::protocol(format!("Invalid reply line: {}", line)))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(CampaignError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = Self::split_enhanced_code(text) {
                    enhanced_code = Some(esc);
                    messages.push(rest.to_string());
                    continue;
                }
            }
            messages.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message: messages,
        })
    }

    fn split_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
        let code = EnhancedStatusCode::parse(head)?;
        Some((code, rest.trim()))
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first text line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all text lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts a negative reply into an error.
    pub fn to_error(&self) -> CampaignError {
        let mut err = CampaignError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP extensions advertised in the EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// 8BITMIME supported.
    pub eight_bit_mime: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (keyword, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match keyword {
                "SIZE" => caps.size = params.trim().parse().ok(),
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(params.split_whitespace().filter_map(AuthMethod::from_capability)),
                "STARTTLS" => caps.starttls = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                _ => {}
            }
        }

        caps
    }

    /// Returns the advertised mechanisms as a list.
    pub fn auth_methods(&self) -> Vec<AuthMethod> {
        self.auth_mechanisms.iter().copied().collect()
    }
}

/// Reply codes the session checks for.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}
