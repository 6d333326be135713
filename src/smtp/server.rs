//! SMTP server implementation

use crate::smtp::auth::{self, AllowAnyCredentials, CredentialValidator};
use crate::smtp::commands::SmtpCommandHandler;
use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{SmtpSession, SmtpState};
use crate::store::MessageSink;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

/// Main SMTP server. Accepts connections and hands every completed message
/// to the given [`MessageSink`], then asks it to enforce retention.
#[derive(Clone)]
pub struct SmtpServer {
    /// Server hostname, used in greetings and HELO/EHLO replies
    hostname: String,
    /// Inbox for messages from unauthenticated sessions
    default_inbox: Option<String>,
    /// Decides AUTH PLAIN outcomes
    validator: Arc<dyn CredentialValidator>,
}

impl SmtpServer {
    /// Create a new SMTP server that accepts any credentials
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            default_inbox: None,
            validator: Arc::new(AllowAnyCredentials),
        }
    }

    /// Set the inbox used when no authenticated user is present
    pub fn with_default_inbox(mut self, inbox: &str) -> Self {
        self.default_inbox = Some(inbox.to_owned());
        self
    }

    /// Replace the credential validator
    pub fn with_validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Start the server on the specified address (blocking).
    /// Completed messages are handed to `store` as they are received.
    pub fn start(&self, addr: &str, store: Arc<dyn MessageSink>) -> Result<(), SmtpError> {
        let listener = TcpListener::bind(addr)?;
        self.start_with_listener(listener, store)
    }

    /// Start the server with an existing listener (blocking).
    /// Completed messages are handed to `store` as they are received.
    pub fn start_with_listener(
        &self,
        listener: TcpListener,
        store: Arc<dyn MessageSink>,
    ) -> Result<(), SmtpError> {
        info!(
            addr = %listener.local_addr().map_err(SmtpError::Io)?,
            "SMTP server listening"
        );

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    // Sessions are independent; the store is the only thing
                    // they share.
                    let server = self.clone();
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        if let Err(e) = server.handle_client(stream, &store) {
                            warn!(error = %e, "error handling client");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "error accepting connection");
                }
            }
        }

        Ok(())
    }

    /// Handle a client connection
    fn handle_client(
        &self,
        mut stream: TcpStream,
        store: &Arc<dyn MessageSink>,
    ) -> Result<(), SmtpError> {
        let mut session = SmtpSession::new(self.default_inbox.clone());
        let mut reader = BufReader::new(stream.try_clone()?);
        let command_handler = SmtpCommandHandler::new(&self.hostname, self.validator.as_ref());

        // Send greeting
        self.send_response(&mut stream, &SmtpResponse::greeting())?;

        let mut line_buffer = Vec::new();
        loop {
            line_buffer.clear();

            match reader.read_until(b'\n', &mut line_buffer) {
                Ok(0) => break, // Connection closed
                Ok(_) => {
                    // Invalid UTF-8 never kills the session; bad bytes are
                    // replaced and the line handled like any other.
                    let line = String::from_utf8_lossy(&line_buffer);
                    // Strip the line terminator only. Leading whitespace is
                    // payload in data mode.
                    let line = line.trim_end_matches(['\r', '\n']);

                    // Body collection bypasses command parsing entirely
                    if session.state == SmtpState::ReceivingData {
                        if line == "." {
                            let response = self.deliver_message(&mut session, store);
                            self.send_response(&mut stream, &response)?;
                        } else if let Err(e) = session.append_body_line(line) {
                            let response =
                                SmtpResponse::error(e.to_response_code(), &e.to_response_message());
                            self.send_response(&mut stream, &response)?;
                            session.reset();
                        }
                        continue;
                    }

                    // The line after AUTH PLAIN is the base64 continuation,
                    // not a command
                    if session.auth_in_progress {
                        let response =
                            auth::process_auth_line(line, self.validator.as_ref(), &mut session);
                        self.send_response(&mut stream, &response)?;
                        continue;
                    }

                    let command = line.trim();
                    if command.is_empty() {
                        continue;
                    }

                    match command_handler.process_command(command, &mut session) {
                        Ok(response) => {
                            self.send_response(&mut stream, &response)?;
                            if response.code == "221" {
                                break; // QUIT command
                            }
                        }
                        Err(e) => {
                            let response =
                                SmtpResponse::error(e.to_response_code(), &e.to_response_message());
                            self.send_response(&mut stream, &response)?;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error reading from client");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Hand the completed message to the store and enforce retention.
    ///
    /// The envelope is consumed up front: success or failure, the session
    /// returns to the no-envelope state and can accept the next MAIL FROM.
    /// A store failure turns into a 451 for this transaction only.
    fn deliver_message(
        &self,
        session: &mut SmtpSession,
        store: &Arc<dyn MessageSink>,
    ) -> SmtpResponse {
        let Some(message) = session.complete_message() else {
            return SmtpResponse::error("451", "No message in progress");
        };

        let sender = message.sender.clone();
        let size = message.size_bytes();

        let stored = store
            .add_message(message)
            .and_then(|()| store.delete_older_messages());

        match stored {
            Ok(()) => {
                info!(sender = %sender, bytes = size, "received message");
                SmtpResponse::ok()
            }
            Err(e) => {
                error!(error = %e, sender = %sender, bytes = size, "error receiving message");
                SmtpResponse::error("451", "Requested action aborted: local error in processing")
            }
        }
    }

    /// Send a response to the client
    fn send_response(
        &self,
        stream: &mut TcpStream,
        response: &SmtpResponse,
    ) -> Result<(), SmtpError> {
        // Ensure response doesn't exceed maximum line length
        let formatted = response.format();
        if formatted.len() > SmtpLimits::REPLY_LINE_MAX_LENGTH {
            // Truncate message if too long
            let truncated_response =
                SmtpResponse::new(&response.code, "Response too long (truncated)");
            stream.write_all(truncated_response.format().as_bytes())?;
        } else {
            stream.write_all(formatted.as_bytes())?;
        }
        stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::auth::StaticCredentials;
    use crate::store::{MemoryStore, StoreError};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Sink that fails every add, for exercising the rejection path
    struct FailingSink;

    impl MessageSink for FailingSink {
        fn add_message(&self, _message: crate::Message) -> Result<(), StoreError> {
            Err(StoreError::Rejected("disk full".to_string()))
        }

        fn delete_older_messages(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn start_server(server: SmtpServer, store: Arc<dyn MessageSink>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            if let Err(e) = server.start_with_listener(listener, store) {
                eprintln!("Error starting server: {e}");
            }
        });
        addr
    }

    fn start_test_server() -> (String, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(None));
        let sink: Arc<dyn MessageSink> = Arc::clone(&store) as Arc<dyn MessageSink>;
        let addr = start_server(SmtpServer::new("test.local"), sink);
        (addr, store)
    }

    fn connect(addr: &str) -> (TcpStream, BufReader<TcpStream>) {
        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut greeting = String::new();
        reader.read_line(&mut greeting).unwrap();
        assert!(greeting.starts_with("220"));
        (stream, reader)
    }

    fn send_command(
        stream: &mut TcpStream,
        reader: &mut BufReader<TcpStream>,
        command: &str,
    ) -> String {
        writeln!(stream, "{command}").unwrap();
        stream.flush().unwrap();

        let mut response = String::new();
        reader.read_line(&mut response).unwrap();
        response.trim().to_string()
    }

    #[test]
    fn test_server_creation() {
        let server = SmtpServer::new("test.local");
        assert_eq!(server.hostname, "test.local");
    }

    #[test]
    fn test_complete_smtp_session() {
        let (addr, store) = start_test_server();
        let (mut stream, mut reader) = connect(&addr);

        let response = send_command(&mut stream, &mut reader, "HELO client.local");
        assert!(response.starts_with("250"));

        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        assert!(response.starts_with("250"));

        let response = send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        assert!(response.starts_with("250"));

        let response = send_command(&mut stream, &mut reader, "DATA");
        assert!(response.starts_with("354"));

        writeln!(stream, "Subject: Test Email").unwrap();
        writeln!(stream).unwrap();
        writeln!(stream, "This is a test email.").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("250"));

        let response = send_command(&mut stream, &mut reader, "QUIT");
        assert!(response.starts_with("221"));

        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "test@example.com");
        assert_eq!(messages[0].recipients, vec!["recipient@example.com"]);
        assert_eq!(messages[0].inbox, "default");
        assert_eq!(
            messages[0].source,
            b"Subject: Test Email\r\n\r\nThis is a test email.\r\n".to_vec()
        );
    }

    #[test]
    fn test_error_handling() {
        let (addr, _store) = start_test_server();
        let (mut stream, mut reader) = connect(&addr);

        // Send invalid command
        let response = send_command(&mut stream, &mut reader, "INVALID");
        assert!(response.starts_with("500"));

        // Try MAIL without HELO
        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        assert!(response.starts_with("503") || response.starts_with("500"));

        let response = send_command(&mut stream, &mut reader, "QUIT");
        assert!(response.starts_with("221"));
    }

    #[test]
    fn test_repeated_mail_from_supersedes_envelope() {
        let (addr, store) = start_test_server();
        let (mut stream, mut reader) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<first@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<old@example.com>");

        // The second MAIL FROM is accepted, not an error
        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<second@example.com>");
        assert!(response.starts_with("250"));

        send_command(&mut stream, &mut reader, "RCPT TO:<new@example.com>");
        send_command(&mut stream, &mut reader, "DATA");
        writeln!(stream, "Fresh envelope").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("250"));

        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "second@example.com");
        assert_eq!(messages[0].recipients, vec!["new@example.com"]);
    }

    #[test]
    fn test_auth_plain_selects_inbox() {
        let store = Arc::new(MemoryStore::new(None));
        let sink: Arc<dyn MessageSink> = Arc::clone(&store) as Arc<dyn MessageSink>;
        let server = SmtpServer::new("test.local")
            .with_validator(Arc::new(StaticCredentials::new("bob", "secret")));
        let addr = start_server(server, sink);
        let (mut stream, mut reader) = connect(&addr);

        send_command(&mut stream, &mut reader, "EHLO client.local");
        // Drain the remaining capability lines
        let mut line = String::new();
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            if line.starts_with("250 ") {
                break;
            }
        }

        let payload = BASE64.encode(b"\0bob\0secret");
        let response = send_command(&mut stream, &mut reader, &format!("AUTH PLAIN {payload}"));
        assert_eq!(response, "235 authentication ok");

        send_command(&mut stream, &mut reader, "MAIL FROM:<bob@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<other@example.com>");
        send_command(&mut stream, &mut reader, "DATA");
        writeln!(stream, "Hello").unwrap();
        stream.flush().unwrap();
        send_command(&mut stream, &mut reader, ".");

        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].inbox, "bob");
    }

    #[test]
    fn test_auth_plain_continuation_line() {
        let store = Arc::new(MemoryStore::new(None));
        let sink: Arc<dyn MessageSink> = Arc::clone(&store) as Arc<dyn MessageSink>;
        let server = SmtpServer::new("test.local")
            .with_validator(Arc::new(StaticCredentials::new("bob", "secret")));
        let addr = start_server(server, sink);
        let (mut stream, mut reader) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");

        let response = send_command(&mut stream, &mut reader, "AUTH PLAIN");
        assert!(response.starts_with("334"));

        let payload = BASE64.encode(b"\0bob\0secret");
        let response = send_command(&mut stream, &mut reader, &payload);
        assert_eq!(response, "235 authentication ok");
    }

    #[test]
    fn test_auth_failure_keeps_session_usable() {
        let store = Arc::new(MemoryStore::new(None));
        let sink: Arc<dyn MessageSink> = Arc::clone(&store) as Arc<dyn MessageSink>;
        let server = SmtpServer::new("test.local")
            .with_default_inbox("inbox-x")
            .with_validator(Arc::new(StaticCredentials::new("bob", "secret")));
        let addr = start_server(server, sink);
        let (mut stream, mut reader) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");

        let payload = BASE64.encode(b"\0bob\0wrong");
        let response = send_command(&mut stream, &mut reader, &format!("AUTH PLAIN {payload}"));
        assert_eq!(response, "535 authentication failed");

        // Malformed base64 also just fails
        let response = send_command(&mut stream, &mut reader, "AUTH PLAIN ???");
        assert_eq!(response, "535 authentication failed");

        // Unauthenticated mail still flows, into the configured default inbox
        send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        send_command(&mut stream, &mut reader, "DATA");
        writeln!(stream, "Hello").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("250"));

        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].inbox, "inbox-x");
    }

    #[test]
    fn test_storage_failure_rejects_without_corrupting_session() {
        let sink: Arc<dyn MessageSink> = Arc::new(FailingSink);
        let addr = start_server(SmtpServer::new("test.local"), sink);
        let (mut stream, mut reader) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<test@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        send_command(&mut stream, &mut reader, "DATA");
        writeln!(stream, "Doomed").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("451"));

        // The session accepts a fresh, independent envelope afterwards
        let response = send_command(&mut stream, &mut reader, "MAIL FROM:<again@example.com>");
        assert!(response.starts_with("250"));
        let response = send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        assert!(response.starts_with("250"));
        let response = send_command(&mut stream, &mut reader, "DATA");
        assert!(response.starts_with("354"));
    }

    #[test]
    fn test_multiple_recipients() {
        let (addr, store) = start_test_server();
        let (mut stream, mut reader) = connect(&addr);

        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<sender@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient1@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient2@example.com>");
        send_command(&mut stream, &mut reader, "DATA");

        writeln!(stream, "Subject: Multiple Recipients").unwrap();
        writeln!(stream).unwrap();
        writeln!(stream, "Test message for multiple recipients").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("250"));

        send_command(&mut stream, &mut reader, "QUIT");

        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].recipients,
            vec!["recipient1@example.com", "recipient2@example.com"]
        );
    }

    #[test]
    fn test_rset_command() {
        let (addr, store) = start_test_server();
        let (mut stream, mut reader) = connect(&addr);

        // Start transaction
        send_command(&mut stream, &mut reader, "HELO client.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<sender@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");

        // Reset transaction
        let response = send_command(&mut stream, &mut reader, "RSET");
        assert!(response.starts_with("250"));

        // Should be able to start new transaction
        send_command(&mut stream, &mut reader, "MAIL FROM:<newsender@example.com>");
        send_command(
            &mut stream,
            &mut reader,
            "RCPT TO:<newrecipient@example.com>",
        );
        send_command(&mut stream, &mut reader, "DATA");

        writeln!(stream, "Subject: After Reset").unwrap();
        writeln!(stream).unwrap();
        writeln!(stream, "This message came after RSET").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("250"));

        send_command(&mut stream, &mut reader, "QUIT");

        // Only the email after RSET was captured
        let messages = store.messages().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "newsender@example.com");
        assert_eq!(messages[0].recipients, vec!["newrecipient@example.com"]);
    }

    #[test]
    fn test_sessions_run_concurrently() {
        let (addr, store) = start_test_server();

        // A blocked session must not stall a second connection.
        let (tx, rx) = mpsc::channel();
        let addr_clone = addr.clone();
        let slow = thread::spawn(move || {
            let (mut stream, mut reader) = connect(&addr_clone);
            send_command(&mut stream, &mut reader, "HELO slow.local");
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
            send_command(&mut stream, &mut reader, "QUIT");
        });

        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let (mut stream, mut reader) = connect(&addr);
        send_command(&mut stream, &mut reader, "HELO fast.local");
        send_command(&mut stream, &mut reader, "MAIL FROM:<fast@example.com>");
        send_command(&mut stream, &mut reader, "RCPT TO:<recipient@example.com>");
        send_command(&mut stream, &mut reader, "DATA");
        writeln!(stream, "quick").unwrap();
        stream.flush().unwrap();
        let response = send_command(&mut stream, &mut reader, ".");
        assert!(response.starts_with("250"));

        slow.join().unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }
}
