//! SMTP server implementation

pub mod auth;
pub mod commands;
pub mod error;
pub mod message;
pub mod response;
pub mod server;
pub mod session;

pub use auth::{AllowAnyCredentials, CredentialValidator, StaticCredentials};
pub use error::{SmtpError, SmtpLimits};
pub use message::Message;
pub use response::SmtpResponse;
pub use server::SmtpServer;
pub use session::{SmtpSession, SmtpState};
