//! Per-user conversation history.
//!
//! Each user gets one append-only [`ConversationContext`], created lazily on
//! first access and kept for the lifetime of the store. Contexts of
//! different users never contend with each other; appends to the same
//! context are serialized by that context's own lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Identifier of a chat user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Bot => f.write_str("bot"),
        }
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// When the message was recorded
    pub timestamp: DateTime<Utc>,
    /// Author
    pub sender: Sender,
    /// Text
    pub content: String,
}

impl Message {
    /// A message stamped with the current time.
    pub fn new(sender: Sender, content: impl Into<String>) -> Self {
        Self { timestamp: Utc::now(), sender, content: content.into() }
    }
}

/// Append-only history of one user.
#[derive(Debug)]
pub struct ConversationContext {
    user_id: UserId,
    created_at: DateTime<Utc>,
    messages: Mutex<Vec<Message>>,
}

impl ConversationContext {
    /// An empty context.
    pub fn new(user_id: UserId) -> Self {
        Self { user_id, created_at: Utc::now(), messages: Mutex::new(Vec::new()) }
    }

    /// Owner of this context.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// When the context was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record a message at the end of the history.
    pub fn append(&self, sender: Sender, content: impl Into<String>) {
        let message = Message::new(sender, content);
        self.messages.lock().push(message);
    }

    /// Snapshot of all messages, oldest first.
    pub fn history(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether nothing was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Render the history as `sender: content` lines.
    pub fn format_history(&self) -> String {
        self.messages
            .lock()
            .iter()
            .map(|m| format!("{}: {}", m.sender, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Maps users to their conversation contexts.
// TODO: no retention bound yet; contexts live until the process exits.
#[derive(Debug, Default)]
pub struct ConversationContextStore {
    contexts: RwLock<HashMap<UserId, Arc<ConversationContext>>>,
}

impl ConversationContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's context, created on first access.
    ///
    /// Concurrent first accesses for one user all observe the same instance.
    pub fn get(&self, user_id: &UserId) -> Arc<ConversationContext> {
        if let Some(context) = self.contexts.read().get(user_id) {
            return Arc::clone(context);
        }

        let mut contexts = self.contexts.write();
        let context = contexts.entry(user_id.clone()).or_insert_with(|| {
            tracing::debug!(user = %user_id, "Created conversation context");
            Arc::new(ConversationContext::new(user_id.clone()))
        });
        Arc::clone(context)
    }

    /// Append a message to the user's history.
    pub fn append(&self, user_id: &UserId, sender: Sender, content: impl Into<String>) {
        self.get(user_id).append(sender, content);
    }

    /// Snapshot of the user's history.
    pub fn history(&self, user_id: &UserId) -> Vec<Message> {
        self.get(user_id).history()
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    /// Whether no user has a context yet.
    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}
