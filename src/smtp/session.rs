//! SMTP session state management

use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::message::{Message, strip_size_parameter};

/// Envelope progress for a single SMTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    /// Initial state - waiting for HELO/EHLO
    Initial,
    /// Greeting received - no envelope open
    Greeted,
    /// MAIL FROM accepted - envelope open, ready for RCPT commands
    MailFromSeen,
    /// At least one RCPT TO accepted - ready for DATA or more RCPT commands
    RecipientsSeen,
    /// DATA accepted - collecting body lines
    ReceivingData,
}

/// Manages the state and data for a single SMTP session.
///
/// The in-progress [`Message`] is owned exclusively by the session: it
/// exists exactly while an envelope is open (from the first accepted MAIL
/// FROM until handoff or discard). Authentication is orthogonal to the
/// envelope states and survives every envelope reset.
#[derive(Debug)]
pub struct SmtpSession {
    /// Current envelope state of the session
    pub state: SmtpState,
    /// Identity bound by a successful AUTH PLAIN, sticky for the session
    pub authenticated_user: Option<String>,
    /// Set while the server is waiting for the AUTH PLAIN continuation line
    pub auth_in_progress: bool,
    /// Client domain from the HELO/EHLO command
    pub client_domain: Option<String>,
    /// Configured inbox for unauthenticated sessions
    default_inbox: Option<String>,
    /// The message being assembled for the currently open envelope
    message: Option<Message>,
}

impl SmtpSession {
    /// Create a new SMTP session
    pub fn new(default_inbox: Option<String>) -> Self {
        Self {
            state: SmtpState::Initial,
            authenticated_user: None,
            auth_in_progress: false,
            client_domain: None,
            default_inbox,
            message: None,
        }
    }

    /// The message for the currently open envelope, if any
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Whether an envelope is currently open
    pub fn envelope_open(&self) -> bool {
        matches!(
            self.state,
            SmtpState::MailFromSeen | SmtpState::RecipientsSeen | SmtpState::ReceivingData
        )
    }

    /// Discard the open envelope and return to the no-envelope state.
    ///
    /// Keeps the client domain and any bound authentication.
    pub fn reset(&mut self) {
        self.state = SmtpState::Greeted;
        self.message = None;
    }

    /// Record the sender of a new envelope.
    ///
    /// Per RFC 2821 section 4.1.1.2, a second MAIL FROM while an envelope is
    /// open is not an error: the open envelope is discarded first and the
    /// new sender starts a fresh one. A trailing ` SIZE=<n>` parameter is
    /// stripped from the stored sender, and the target inbox is resolved
    /// here, not at handoff time.
    pub fn handle_mail_from(&mut self, sender: &str) -> Result<(), SmtpError> {
        if self.envelope_open() {
            self.reset();
        }

        let sender = strip_size_parameter(sender);
        if sender.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        self.message = Some(Message::new(sender.to_owned(), self.resolve_inbox()));
        self.state = SmtpState::MailFromSeen;
        Ok(())
    }

    /// Add a recipient address to the open envelope
    pub fn add_recipient(&mut self, recipient: String) -> Result<(), SmtpError> {
        if recipient.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        let Some(message) = self.message.as_mut() else {
            return Err(SmtpError::InvalidState(
                "No envelope open for recipient".to_string(),
            ));
        };

        if message.recipients.len() >= SmtpLimits::MAX_RECIPIENTS {
            return Err(SmtpError::TooManyRecipients {
                max: SmtpLimits::MAX_RECIPIENTS,
            });
        }

        message.recipients.push(recipient);
        self.state = SmtpState::RecipientsSeen;
        Ok(())
    }

    /// Start collecting body lines
    pub fn begin_data(&mut self) -> Result<(), SmtpError> {
        if self.state != SmtpState::RecipientsSeen {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        self.state = SmtpState::ReceivingData;
        Ok(())
    }

    /// Append one body line to the open envelope's message.
    ///
    /// Lines are stored with CRLF termination regardless of the incoming
    /// line ending, in receipt order; calling this across several chunks of
    /// a larger body is fine.
    pub fn append_body_line(&mut self, line: &str) -> Result<(), SmtpError> {
        let line_size = line.len() + 2; // +2 for CRLF

        if line_size > SmtpLimits::TEXT_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::TEXT_LINE_MAX_LENGTH,
            });
        }

        let Some(message) = self.message.as_mut() else {
            return Err(SmtpError::InvalidState(
                "No envelope open for data".to_string(),
            ));
        };

        if message.size_bytes() + line_size > SmtpLimits::MAX_DATA_SIZE {
            return Err(SmtpError::TooMuchData {
                max: SmtpLimits::MAX_DATA_SIZE,
            });
        }

        message.append_body_line(line);
        Ok(())
    }

    /// Close the envelope and hand out its message for delivery.
    ///
    /// The session returns to the no-envelope state whatever the caller
    /// does with the message afterwards.
    pub fn complete_message(&mut self) -> Option<Message> {
        self.state = SmtpState::Greeted;
        self.message.take()
    }

    /// Set the client domain from the HELO/EHLO command
    pub fn set_client_domain(&mut self, domain: String) -> Result<(), SmtpError> {
        if domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        self.client_domain = Some(domain);
        self.reset(); // Clear any existing transaction
        Ok(())
    }

    /// Resolve the inbox a new envelope belongs to: the authenticated user
    /// if present, else the configured default, else "default".
    pub fn resolve_inbox(&self) -> String {
        self.authenticated_user
            .as_deref()
            .or(self.default_inbox.as_deref())
            .unwrap_or("default")
            .trim()
            .to_owned()
    }

    /// Check if the session is ready for a specific command
    pub fn can_execute_command(&self, command: &str) -> bool {
        match command.to_uppercase().as_str() {
            "HELO" | "EHLO" => true, // Greetings can be sent at any time
            "MAIL" => self.state != SmtpState::Initial,
            "RCPT" => {
                self.state == SmtpState::MailFromSeen || self.state == SmtpState::RecipientsSeen
            }
            "DATA" => self.state == SmtpState::RecipientsSeen,
            "RSET" => self.state != SmtpState::Initial,
            "AUTH" => self.state != SmtpState::Initial,
            "NOOP" => true, // NOOP can be sent at any time
            "QUIT" => true, // QUIT can be sent at any time
            _ => false,
        }
    }

    /// Get the current recipient count
    pub fn recipient_count(&self) -> usize {
        self.message
            .as_ref()
            .map_or(0, |message| message.recipients.len())
    }
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self::new(None)
    }
}
