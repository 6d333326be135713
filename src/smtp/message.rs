//! Captured message record

use std::borrow::Cow;
use std::time::SystemTime;

/// A message captured by the server, as assembled from one SMTP envelope
#[derive(Debug, Clone)]
pub struct Message {
    /// Normalized sender address from MAIL FROM
    pub sender: String,

    /// Recipient addresses in the order they were given, duplicates kept
    pub recipients: Vec<String>,

    /// Raw message bytes: each received data line suffixed with CRLF
    pub source: Vec<u8>,

    /// Logical partition the message belongs to, resolved at MAIL FROM time
    pub inbox: String,

    /// When the envelope was opened
    pub received_at: SystemTime,
}

impl Message {
    /// Create a new, empty message for a fresh envelope
    pub fn new(sender: String, inbox: String) -> Self {
        Self {
            sender,
            recipients: Vec::new(),
            source: Vec::new(),
            inbox,
            received_at: SystemTime::now(),
        }
    }

    /// Append one body line, normalized to CRLF termination
    pub fn append_body_line(&mut self, line: &str) {
        self.source.extend_from_slice(line.as_bytes());
        self.source.extend_from_slice(b"\r\n");
    }

    /// Check if this message was sent to a specific recipient
    pub fn has_recipient(&self, recipient: &str) -> bool {
        self.recipients.iter().any(|addr| addr == recipient)
    }

    /// Get the size of the raw message in bytes
    pub fn size_bytes(&self) -> usize {
        self.source.len()
    }

    /// View the raw message as text, replacing any non-UTF-8 bytes
    pub fn source_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.source)
    }

    /// Get the subject line from the message headers (if present)
    pub fn subject(&self) -> Option<String> {
        for line in self.source_text().lines() {
            if line.is_empty() {
                // End of headers
                break;
            }
            if let Some(subject) = line.strip_prefix("Subject: ") {
                return Some(subject.to_owned());
            }
            if let Some(subject) = line.strip_prefix("subject: ") {
                return Some(subject.to_owned());
            }
        }
        None
    }
}

/// Strip a trailing ` SIZE=<digits>` parameter from a sender address.
///
/// Servers advertising the SIZE extension receive senders like
/// `alice@example.com SIZE=12345`. The match is the literal token followed
/// by digits running to the end of the string; anything else is left alone.
pub(crate) fn strip_size_parameter(sender: &str) -> &str {
    if let Some(idx) = sender.rfind(" SIZE=") {
        let digits = &sender[idx + " SIZE=".len()..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return &sender[..idx];
        }
    }
    sender
}
