//! Request-scoped chat types shared by the normalizer, the upstream client and
//! the response translators.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A validated chat completion request.
///
/// `messages` is never empty and keeps the order the client sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub model: Option<String>,
    /// Generation parameters forwarded verbatim (temperature, top_p, ...)
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

impl FinishReason {
    /// Map an upstream `finish_reason` string. Anything that is not a length
    /// cutoff or an explicit error counts as a normal stop.
    pub fn from_upstream(reason: &str) -> Self {
        match reason {
            "length" | "max_tokens" => Self::Length,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One incremental piece of a streamed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionChunk {
    /// Position of this chunk within its stream, starting at 0.
    pub index: u64,
    pub content: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

impl CompletionChunk {
    pub fn text(index: u64, content: impl Into<String>) -> Self {
        Self {
            index,
            content: content.into(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn with_finish(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

/// Fully aggregated output of a non-streaming generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

impl CompletionResult {
    pub fn new(content: impl Into<String>, finish_reason: FinishReason) -> Self {
        Self {
            content: content.into(),
            finish_reason,
            usage: None,
        }
    }
}
