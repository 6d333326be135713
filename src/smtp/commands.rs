//! Implementation of SMTP commands

use crate::smtp::auth::{self, CredentialValidator};
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;

/// Handles SMTP commands and returns appropriate responses
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
    validator: &'a dyn CredentialValidator,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(hostname: &'a str, validator: &'a dyn CredentialValidator) -> Self {
        Self {
            hostname,
            validator,
        }
    }

    /// Process a command line and return a response
    pub fn process_command(
        &self,
        command_line: &str,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        // Check command line length
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let cmd = parts[0].to_uppercase();

        match cmd.as_str() {
            "HELO" => self.handle_helo(parts, session),
            "EHLO" => self.handle_ehlo(parts, session),
            "AUTH" => self.handle_auth(parts, session),
            "MAIL" => self.handle_mail(parts, session),
            "RCPT" => self.handle_rcpt(parts, session),
            "DATA" => self.handle_data(parts, session),
            "RSET" => self.handle_rset(session),
            "NOOP" => self.handle_noop(),
            "QUIT" => self.handle_quit(),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    /// Handle HELO command
    fn handle_helo(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "HELO requires domain argument".to_string(),
            ));
        }

        let client_domain = parts[1].to_string();
        session.set_client_domain(client_domain.clone())?;

        Ok(SmtpResponse::helo(self.hostname, &client_domain))
    }

    /// Handle EHLO command
    fn handle_ehlo(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "EHLO requires domain argument".to_string(),
            ));
        }

        let client_domain = parts[1].to_string();
        session.set_client_domain(client_domain.clone())?;

        Ok(SmtpResponse::ehlo(self.hostname, &client_domain))
    }

    /// Handle AUTH command.
    ///
    /// Only the PLAIN mechanism is supported. The client either includes the
    /// base64 initial response on the command line, or gets a 334
    /// continuation and sends it as the next line.
    fn handle_auth(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("AUTH") {
            return Err(SmtpError::InvalidState(
                "AUTH command requires HELO first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "AUTH requires a mechanism argument".to_string(),
            ));
        }

        if !parts[1].eq_ignore_ascii_case("PLAIN") {
            return Err(SmtpError::UnsupportedAuthMechanism);
        }

        match parts.get(2) {
            Some(initial_response) => Ok(auth::process_auth_line(
                initial_response,
                self.validator,
                session,
            )),
            None => {
                session.auth_in_progress = true;
                Ok(SmtpResponse::auth_continue())
            }
        }
    }

    /// Handle MAIL command
    fn handle_mail(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "MAIL requires FROM argument".to_string(),
            ));
        }

        let from_part = parts[1..].join(" ");
        if !from_part.to_uppercase().starts_with("FROM:") {
            return Err(SmtpError::InvalidSyntax(
                "MAIL command must be 'MAIL FROM:<address>'".to_string(),
            ));
        }

        let from_addr = from_part[5..].trim();
        if !from_addr.starts_with('<') {
            return Err(SmtpError::InvalidSyntax(
                "FROM address must be enclosed in angle brackets".to_string(),
            ));
        }

        let Some(close) = from_addr.find('>') else {
            return Err(SmtpError::InvalidSyntax(
                "FROM address must be enclosed in angle brackets".to_string(),
            ));
        };

        let addr = &from_addr[1..close];
        // ESMTP parameters after the closing bracket (" SIZE=<n>") stay
        // attached to the sender; the session normalizes them off.
        let esmtp_params = &from_addr[close + 1..];

        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "FROM address cannot be empty".to_string(),
            ));
        }

        // Validate email address components
        self.validate_email_address(addr)?;

        session.handle_mail_from(&format!("{addr}{esmtp_params}"))?;

        Ok(SmtpResponse::ok())
    }

    /// Handle RCPT command
    fn handle_rcpt(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(
                "RCPT requires TO argument".to_string(),
            ));
        }

        let to_part = parts[1..].join(" ");
        if !to_part.to_uppercase().starts_with("TO:") {
            return Err(SmtpError::InvalidSyntax(
                "RCPT command must be 'RCPT TO:<address>'".to_string(),
            ));
        }

        let to_addr = to_part[3..].trim();
        if !to_addr.starts_with('<') || !to_addr.ends_with('>') {
            return Err(SmtpError::InvalidSyntax(
                "TO address must be enclosed in angle brackets".to_string(),
            ));
        }

        let addr = to_addr[1..to_addr.len() - 1].to_string();
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        // Validate email address components
        self.validate_email_address(&addr)?;

        session.add_recipient(addr)?;

        Ok(SmtpResponse::ok())
    }

    /// Handle DATA command
    fn handle_data(
        &self,
        parts: Vec<&str>,
        session: &mut SmtpSession,
    ) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        session.begin_data()?;

        Ok(SmtpResponse::data_start())
    }

    /// Handle RSET command
    fn handle_rset(&self, session: &mut SmtpSession) -> Result<SmtpResponse, SmtpError> {
        if !session.can_execute_command("RSET") {
            return Err(SmtpError::InvalidState(
                "RSET command requires HELO first".to_string(),
            ));
        }

        session.reset();
        Ok(SmtpResponse::ok())
    }

    /// Handle NOOP command
    fn handle_noop(&self) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::ok())
    }

    /// Handle QUIT command
    fn handle_quit(&self) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::quit())
    }

    /// Validate email address format and size limits
    fn validate_email_address(&self, addr: &str) -> Result<(), SmtpError> {
        // Check for @ symbol
        if let Some(at_pos) = addr.find('@') {
            let user_part = &addr[..at_pos];
            let domain_part = &addr[at_pos + 1..];

            // Check user part length
            if user_part.len() > SmtpLimits::USER_MAX_LENGTH {
                return Err(SmtpError::UserTooLong {
                    max: SmtpLimits::USER_MAX_LENGTH,
                });
            }

            // Check domain part length
            if domain_part.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
                return Err(SmtpError::DomainTooLong {
                    max: SmtpLimits::DOMAIN_MAX_LENGTH,
                });
            }

            // Basic validation - must have user and domain parts
            if user_part.is_empty() || domain_part.is_empty() {
                return Err(SmtpError::InvalidSyntax(
                    "Invalid email address format".to_string(),
                ));
            }
        } else {
            return Err(SmtpError::InvalidSyntax(
                "Email address must contain @ symbol".to_string(),
            ));
        }

        Ok(())
    }
}
