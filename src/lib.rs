//! # Mailsink
//!
//! Mailsink is an SMTP server that captures mail instead of delivering it.
//!
//! Off-the-shelf mail clients and libraries deliver to it like to any other
//! SMTP server; every message ends up in a local store where it can be
//! inspected, partitioned into inboxes by authenticated user.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::net::TcpListener;
//! use std::sync::Arc;
//! use std::thread;
//!
//! use mailsink::{MemoryStore, MessageSink, SmtpServer};
//!
//! // Keep at most 100 messages; older ones are evicted
//! let store = Arc::new(MemoryStore::new(Some(100)));
//! let listener = TcpListener::bind("127.0.0.1:0").unwrap();
//! let addr = listener.local_addr().unwrap();
//!
//! let server = SmtpServer::new("mailsink.local").with_default_inbox("inbox");
//! let sink: Arc<dyn MessageSink> = Arc::clone(&store) as Arc<dyn MessageSink>;
//! thread::spawn(move || {
//!     let _ = server.start_with_listener(listener, sink);
//! });
//!
//! // Deliver to `addr` with any SMTP client, then inspect the capture:
//! for message in store.messages().unwrap() {
//!     println!("{} -> inbox {}", message.sender, message.inbox);
//! }
//! ```
//!
//! ## Supported SMTP commands
//!
//! - `HELO` / `EHLO` - Identify the sender (EHLO advertises `AUTH PLAIN`)
//! - `AUTH PLAIN` - Optional authentication; the username selects the inbox
//! - `MAIL FROM` - Specify the sender's address (` SIZE=<n>` suffix tolerated)
//! - `RCPT TO` - Specify the destination (multiple destinations are supported)
//! - `DATA` - Send the message body
//! - `RSET` - Reset the current transaction
//! - `NOOP` - Do nothing
//! - `QUIT` - Close connection
//!
//! ## Notes
//!
//! - Nothing is ever forwarded. Capture is the whole point.
//! - Sending MAIL FROM a second time mid-envelope is legal per RFC 2821 and
//!   starts the envelope over; only the second envelope is captured.
//! - Authentication accepts any credentials by default; plug in a
//!   [`CredentialValidator`] to restrict it. A 535 reply is all a client
//!   learns about why authentication failed.
//! - Message bodies are stored byte-exact with CRLF line endings,
//!   whatever line endings the client used.
//! - SSL/TLS connection is not supported.
//!
//! ## Size Limits
//!
//! The server enforces RFC 821 size limits:
//! - User names: 64 characters max
//! - Domain names: 64 characters max
//! - Paths: 256 characters max
//! - Command lines: 512 characters max
//! - Text lines: 1000 characters max
//! - Recipients: 100 max per message

mod smtp;
mod store;

pub use smtp::{
    AllowAnyCredentials, CredentialValidator, Message, SmtpError, SmtpLimits, SmtpResponse,
    SmtpServer, SmtpSession, SmtpState, StaticCredentials,
};
pub use store::{MemoryStore, MessageSink, StoreError};
