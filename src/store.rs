//! Bounded in-memory message store

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::smtp::message::Message;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store lock poisoned by a panicked writer")]
    Poisoned,

    #[error("store rejected message: {0}")]
    Rejected(String),
}

/// Where completed messages are handed off.
///
/// Implementations must be safe to call from several sessions at once:
/// adds are append-only and eviction may run while another session is
/// adding. The server always attempts [`delete_older_messages`] right
/// after a successful add.
///
/// [`delete_older_messages`]: MessageSink::delete_older_messages
pub trait MessageSink: Send + Sync {
    /// Append a captured message to the store
    fn add_message(&self, message: Message) -> Result<(), StoreError>;

    /// Evict the oldest messages beyond the configured retention cap
    fn delete_older_messages(&self) -> Result<(), StoreError>;
}

/// In-memory message store with an optional retention cap.
///
/// Messages are kept in arrival order; with a cap of `Some(n)`, eviction
/// drops the oldest entries until at most `n` remain. `None` disables
/// eviction entirely.
#[derive(Debug)]
pub struct MemoryStore {
    max_messages: Option<usize>,
    messages: Mutex<VecDeque<Message>>,
}

impl MemoryStore {
    /// Create a new store retaining at most `max_messages` entries
    pub fn new(max_messages: Option<usize>) -> Self {
        Self {
            max_messages,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of all retained messages, oldest first
    pub fn messages(&self) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(messages.iter().cloned().collect())
    }

    /// Snapshot of the retained messages filed under one inbox
    pub fn messages_for_inbox(&self, inbox: &str) -> Result<Vec<Message>, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(messages
            .iter()
            .filter(|message| message.inbox == inbox)
            .cloned()
            .collect())
    }

    /// Number of retained messages
    pub fn len(&self) -> Result<usize, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(messages.len())
    }

    /// Whether the store holds no messages
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Drop every retained message
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        messages.clear();
        Ok(())
    }
}

impl MessageSink for MemoryStore {
    fn add_message(&self, message: Message) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        messages.push_back(message);
        Ok(())
    }

    fn delete_older_messages(&self) -> Result<(), StoreError> {
        let Some(max) = self.max_messages else {
            return Ok(());
        };

        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        while messages.len() > max {
            messages.pop_front();
        }
        Ok(())
    }
}
