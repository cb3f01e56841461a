//! Message list cache for one chat conversation.
//!
//! SYSTEM CONTEXT
//! ==============
//! Owned exclusively by the connection driver; there is no cross-view
//! sharing. Insertion order is arrival order: the history page is loaded
//! once (already reversed into chronological order) before any live
//! message arrives.

#[cfg(test)]
#[path = "chat_test.rs"]
mod chat_test;

use wire::ChatMessage;

/// Append-only ordered sequence of chat messages with echo deduplication.
#[derive(Clone, Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the historical page fetched at startup.
    ///
    /// Must run before live messages start arriving; the batch is kept
    /// in the order given (callers reverse newest-first server pages
    /// beforehand).
    pub fn load_history(&mut self, batch: Vec<ChatMessage>) {
        let mut batch = batch;
        batch.append(&mut self.messages);
        self.messages = batch;
    }

    /// Append a live message unless it duplicates an existing entry.
    ///
    /// Returns `false` when the (sender, content, timestamp) triple is
    /// already present, which drops the server echo of a message the
    /// client appended optimistically on send.
    pub fn append_live(&mut self, message: ChatMessage) -> bool {
        let duplicate = self.messages.iter().any(|existing| {
            existing.sender == message.sender
                && existing.content == message.content
                && existing.timestamp == message.timestamp
        });
        if duplicate {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// All messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of cached messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
