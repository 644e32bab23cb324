//! Outbound message formatting.
//!
//! Produces an RFC 5322 `text/plain` message with a quoted-printable body,
//! an RFC 2047 encoded subject when it is not plain ASCII, and the DATA
//! payload with dot-stuffing applied.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::{CampaignError, CampaignErrorKind, CampaignResult};

/// One fully rendered message addressed to a single recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    /// Envelope and header sender.
    pub from: String,
    /// Envelope and header recipient.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl OutboundMessage {
    /// Creates a message.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Returns the sender in angle brackets for `MAIL FROM`.
    pub fn envelope_from(&self) -> String {
        format!("<{}>", self.from.trim())
    }

    /// Returns the recipient in angle brackets for `RCPT TO`.
    pub fn envelope_to(&self) -> String {
        format!("<{}>", self.to.trim())
    }

    /// Checks that addresses and subject cannot inject headers or commands.
    pub fn validate(&self) -> CampaignResult<()> {
        for (field, value) in [("sender", &self.from), ("recipient", &self.to)] {
            let value = value.trim();
            if value.is_empty() || !value.contains('@') {
                return Err(CampaignError::new(
                    CampaignErrorKind::RecipientRejected,
                    format!("Invalid {} address '{}'", field, value),
                ));
            }
            if value.chars().any(|c| c.is_control() || c == '<' || c == '>') {
                return Err(CampaignError::new(
                    CampaignErrorKind::RecipientRejected,
                    format!("Invalid characters in {} address", field),
                ));
            }
        }
        if self.subject.contains(['\r', '\n']) {
            return Err(CampaignError::new(
                CampaignErrorKind::MessageRejected,
                "Subject must be a single line",
            ));
        }
        Ok(())
    }

    /// Formats the message as of now.
    pub fn to_rfc5322(&self) -> Vec<u8> {
        MessageFormatter::new(Utc::now()).format(self)
    }
}

/// Formats messages with a fixed Date header.
pub struct MessageFormatter {
    date: DateTime<Utc>,
}

impl MessageFormatter {
    /// Creates a formatter stamping messages with `date`.
    pub fn new(date: DateTime<Utc>) -> Self {
        Self { date }
    }

    /// Encodes the message headers and body.
    pub fn format(&self, message: &OutboundMessage) -> Vec<u8> {
        let mut output = Vec::new();

        let domain = message
            .from
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim())
            .unwrap_or("localhost");

        write_header(&mut output, "Date", &self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string());
        write_header(&mut output, "From", message.from.trim());
        write_header(&mut output, "To", message.to.trim());
        write_header(&mut output, "Subject", &encode_header(&message.subject));
        write_header(
            &mut output,
            "Message-ID",
            &format!("<{}.{}@{}>", Uuid::new_v4(), self.date.timestamp(), domain),
        );
        write_header(&mut output, "MIME-Version", "1.0");
        write_header(&mut output, "Content-Type", "text/plain; charset=utf-8");
        write_header(&mut output, "Content-Transfer-Encoding", "quoted-printable");
        output.extend_from_slice(b"\r\n");

        let body = normalize_line_endings(&message.body);
        output.extend_from_slice(&quoted_printable::encode(body.as_bytes()));
        output
    }
}

fn write_header(output: &mut Vec<u8>, name: &str, value: &str) {
    output.extend_from_slice(name.as_bytes());
    output.extend_from_slice(b": ");
    output.extend_from_slice(value.as_bytes());
    output.extend_from_slice(b"\r\n");
}

/// Input bytes per encoded-word. 39 bytes give 52 base64 characters, so a
/// word stays within 75 characters and `Subject: ` plus one word within 76.
const ENCODED_WORD_BYTES: usize = 39;

/// RFC 2047 B-encoding for non-ASCII header values, one encoded-word per
/// chunk of whole characters, folded onto continuation lines.
fn encode_header(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }
    words.join("\r\n ")
}

fn encoded_word(text: &str) -> String {
    format!("=?UTF-8?B?{}?=", BASE64.encode(text.as_bytes()))
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Builds the DATA payload: dot-stuffed content terminated by `CRLF.CRLF`.
pub fn prepare_data_content(encoded: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(encoded.len() + 8);
    let mut at_line_start = true;

    for &byte in encoded {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }
        output.push(byte);
        at_line_start = byte == b'\n';
    }

    if !output.ends_with(b"\r\n") {
        output.extend_from_slice(b"\r\n");
    }
    output.extend_from_slice(b".\r\n");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message() -> OutboundMessage {
        OutboundMessage::new(
            "me@example.com",
            "you@example.org",
            "Hello from Acme",
            "Dear Ann,\n\nSee you soon.",
        )
    }

    #[test]
    fn test_format_headers() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let encoded = MessageFormatter::new(date).format(&message());
        let text = String::from_utf8(encoded).unwrap();

        assert!(text.starts_with("Date: Fri, 01 Mar 2024 09:30:00 +0000\r\n"));
        assert!(text.contains("From: me@example.com\r\n"));
        assert!(text.contains("To: you@example.org\r\n"));
        assert!(text.contains("Subject: Hello from Acme\r\n"));
        assert!(text.contains("@example.com>\r\n"));
        assert!(text.contains("Content-Transfer-Encoding: quoted-printable\r\n\r\n"));
        assert!(text.ends_with("Dear Ann,\r\n\r\nSee you soon."));
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        assert_eq!(encode_header("Plain"), "Plain");
        let encoded = encode_header("Grüße");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with("?="));
    }

    #[test]
    fn test_long_subject_is_split_into_words() {
        let subject = "Ünsere neuesten Angebote für Ihr Unternehmen – jetzt gültig bis Ende März";
        let encoded = encode_header(subject);

        let words: Vec<&str> = encoded.split("\r\n ").collect();
        assert!(words.len() > 1);
        let mut decoded = Vec::new();
        for word in &words {
            assert!(word.len() <= 75, "encoded-word too long: {}", word);
            let payload = word
                .strip_prefix("=?UTF-8?B?")
                .and_then(|w| w.strip_suffix("?="))
                .unwrap();
            decoded.extend(BASE64.decode(payload).unwrap());
        }
        assert_eq!(String::from_utf8(decoded).unwrap(), subject);

        let date = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let mut long = message();
        long.subject = subject.to_string();
        let text = String::from_utf8(MessageFormatter::new(date).format(&long)).unwrap();
        assert!(text.lines().all(|line| line.trim_end_matches('\r').len() <= 78));
    }

    #[test]
    fn test_dot_stuffing() {
        let data = prepare_data_content(b"Line 1\r\n.Line 2\r\n..Line 3");
        assert_eq!(data, b"Line 1\r\n..Line 2\r\n...Line 3\r\n.\r\n".to_vec());
    }

    #[test]
    fn test_validate_rejects_injection() {
        assert!(message().validate().is_ok());

        let mut bad = message();
        bad.to = "victim@example.org\r\nRCPT TO:<other@example.org>".to_string();
        assert_eq!(
            bad.validate().unwrap_err().kind(),
            CampaignErrorKind::RecipientRejected
        );

        let mut bad = message();
        bad.to = "not-an-address".to_string();
        assert!(bad.validate().is_err());

        let mut bad = message();
        bad.subject = "Hi\r\nBcc: all@example.org".to_string();
        assert_eq!(
            bad.validate().unwrap_err().kind(),
            CampaignErrorKind::MessageRejected
        );
    }
}
