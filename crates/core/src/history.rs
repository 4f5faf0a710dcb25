use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of user/agent messages kept for context by default.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Only used for the persona prompt at the head of a request.
    System,
    User,
    Agent,
}

impl Role {
    /// The role name chat-completion APIs expect.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Agent => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }
}

/// A bounded, ordered conversation window.
///
/// Holds at most `capacity` messages; the oldest are evicted first. The system
/// prompt sits outside the window and is never evicted.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    prompt: Message,
    messages: VecDeque<Message>,
    capacity: usize,
}

impl MessageHistory {
    pub fn new(prompt: impl Into<String>, capacity: usize) -> Self {
        Self {
            prompt: Message::system(prompt),
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            if let Some(evicted) = self.messages.pop_front() {
                tracing::trace!("evicting {:?} message from history", evicted.role);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// The full message list sent to the completion service: prompt first, then the window.
    pub fn to_request(&self) -> Vec<Message> {
        std::iter::once(self.prompt.clone())
            .chain(self.messages.iter().cloned())
            .collect()
    }
}
