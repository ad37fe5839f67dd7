//! Conversation shapes and request normalization.
//!
//! Callers may send messages either as typed role/content pairs or as raw
//! JSON maps, and the prompt either as a bare string or as a content-block
//! array. Normalization folds both into one `Message` shape while preserving
//! chronological order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content, mirroring the converse wire shapes:
/// `{"text": ...}`, `{"toolUse": {...}}`, `{"toolResult": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(rename = "toolUse")]
        tool_use: ToolUseBlock,
    },
    ToolResult {
        #[serde(rename = "toolResult")]
        tool_result: ToolResultBlock,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: Value,
    pub status: ToolResultStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }
}

/// The request `prompt` field: a bare string or pre-built content blocks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for PromptInput {
    fn default() -> Self {
        PromptInput::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: Role,
    content: IncomingContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IncomingContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Normalize caller-supplied history into ordered `Message`s.
pub fn normalize_messages(raw: Vec<Value>) -> Result<Vec<Message>> {
    raw.into_iter()
        .map(|value| {
            let incoming: IncomingMessage = serde_json::from_value(value)
                .map_err(|err| RuntimeError::InvalidInput(format!("malformed message: {err}")))?;
            let content = match incoming.content {
                IncomingContent::Text(text) => vec![ContentBlock::Text { text }],
                IncomingContent::Blocks(blocks) => blocks,
            };
            Ok(Message {
                role: incoming.role,
                content,
            })
        })
        .collect()
}

/// Normalize the request prompt into the run's final user message.
///
/// An empty prompt contributes nothing (the history alone may carry the
/// request), so the caller decides whether an empty transcript is an error.
pub fn normalize_prompt(prompt: PromptInput) -> Option<Message> {
    match prompt {
        PromptInput::Text(text) => {
            if text.trim().is_empty() {
                None
            } else {
                Some(Message::user_text(text))
            }
        }
        PromptInput::Blocks(blocks) => {
            if blocks.is_empty() {
                None
            } else {
                Some(Message {
                    role: Role::User,
                    content: blocks,
                })
            }
        }
    }
}
