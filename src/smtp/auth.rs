//! AUTH PLAIN negotiation

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

use crate::smtp::response::SmtpResponse;
use crate::smtp::session::SmtpSession;

/// Validates credentials presented over AUTH PLAIN.
///
/// The server consults exactly one validator per AUTH exchange; the answer
/// decides between the 235 and 535 replies.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, username: &str, password: &str) -> bool;
}

/// Accepts any credentials. The username still selects the inbox the
/// session's messages are filed under.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnyCredentials;

impl CredentialValidator for AllowAnyCredentials {
    fn validate(&self, _username: &str, _password: &str) -> bool {
        true
    }
}

/// Accepts a single fixed username/password pair
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }
}

impl CredentialValidator for StaticCredentials {
    fn validate(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

/// Process one base64 line of the AUTH PLAIN exchange.
///
/// The payload is the SASL PLAIN triple `authzid NUL authcid NUL password`;
/// the authzid is ignored and missing fields fall back to empty. Decode
/// errors, short payloads and rejected credentials all collapse into the
/// same 535 reply, and the session's auth-in-progress marker is cleared no
/// matter the outcome.
pub fn process_auth_line(
    line: &str,
    validator: &dyn CredentialValidator,
    session: &mut SmtpSession,
) -> SmtpResponse {
    session.auth_in_progress = false;

    let payload = match BASE64.decode(line.trim()) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "AUTH line is not valid base64");
            return SmtpResponse::auth_failed();
        }
    };

    let mut fields = payload.split(|byte| *byte == 0);
    let _authzid = fields.next();
    let username = String::from_utf8_lossy(fields.next().unwrap_or_default()).into_owned();
    let password = String::from_utf8_lossy(fields.next().unwrap_or_default()).into_owned();

    if validator.validate(&username, &password) {
        session.authenticated_user = Some(username.trim().to_owned());
        SmtpResponse::auth_ok()
    } else {
        debug!(username = %username, "credential validator rejected AUTH PLAIN");
        SmtpResponse::auth_failed()
    }
}
