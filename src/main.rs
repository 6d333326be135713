use std::env;
use std::process;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailsink::{MemoryStore, MessageSink, SmtpServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    let addr = args.get(1).map_or("127.0.0.1:1025", String::as_str);
    let hostname = args.get(2).map_or("mailsink.local", String::as_str);
    let default_inbox = args.get(3).cloned();
    let max_messages = args.get(4).and_then(|raw| raw.parse::<usize>().ok());

    info!(addr, hostname, ?default_inbox, ?max_messages, "starting Mailsink");

    let store: Arc<dyn MessageSink> = Arc::new(MemoryStore::new(max_messages));

    let mut server = SmtpServer::new(hostname);
    if let Some(inbox) = default_inbox {
        server = server.with_default_inbox(&inbox);
    }

    if let Err(e) = server.start(addr, store) {
        error!(error = %e, "failed to start server");
        process::exit(1);
    }
}
