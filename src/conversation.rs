//! Chat prompt builder for multi-turn conversations sent as one prompt.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    fn tag(self) -> &'static str {
        match self {
            MessageRole::System => "<|system|>",
            MessageRole::User => "<|user|>",
            MessageRole::Assistant => "<|assistant|>",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}\n\n", self.role.tag(), self.content)
    }
}

/// Ordered, role-tagged message history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, role: MessageRole, content: impl Into<String>) -> &mut Self {
        self.messages.push(ChatMessage::new(role, content));
        self
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Render every message, then cue the model to answer as the assistant
    pub fn build_prompt(&self) -> String {
        let mut prompt: String = self.messages.iter().map(ToString::to_string).collect();
        prompt.push_str(MessageRole::Assistant.tag());
        prompt.push('\n');
        prompt
    }
}
