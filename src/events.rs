//! Run events and their newline-delimited JSON framing.
//!
//! Every line written to the caller is one `{"event": {...}}` object. A run
//! ends with either its own completion marker (`messageStop` carrying a final
//! stop reason) or exactly one synthesized `internalServerException` event;
//! nothing follows the terminal event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Role, ToolResultStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    GuardrailIntervened,
    ContentFiltered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    #[serde(rename = "messageStart")]
    MessageStart { role: Role },

    #[serde(rename = "contentBlockDelta")]
    ContentBlockDelta {
        delta: Delta,
        #[serde(rename = "contentBlockIndex")]
        content_block_index: usize,
    },

    #[serde(rename = "contentBlockStop")]
    ContentBlockStop {
        #[serde(rename = "contentBlockIndex")]
        content_block_index: usize,
    },

    #[serde(rename = "toolUse")]
    ToolUse {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        name: String,
        input: Value,
    },

    #[serde(rename = "toolResult")]
    ToolResult {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        name: String,
        status: ToolResultStatus,
        content: Value,
    },

    #[serde(rename = "messageStop")]
    MessageStop {
        #[serde(rename = "stopReason")]
        stop_reason: StopReason,
    },

    #[serde(rename = "internalServerException")]
    InternalServerException { message: String },
}

impl RunEvent {
    /// A `messageStop` that hands control to the tool phase is not terminal;
    /// every other stop, and the synthesized error, is.
    pub fn is_terminal(&self) -> bool {
        match self {
            RunEvent::MessageStop { stop_reason } => *stop_reason != StopReason::ToolUse,
            RunEvent::InternalServerException { .. } => true,
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RunEvent::InternalServerException { .. })
    }
}

/// The single top-level wire shape: `{"event": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: RunEvent,
}

impl EventEnvelope {
    pub fn new(event: RunEvent) -> Self {
        Self { event }
    }

    /// Serialize to one NDJSON line, newline included.
    pub fn to_line(&self) -> String {
        // RunEvent contains nothing that can fail to serialize; the fallback
        // keeps the stream well-formed even if that ever changes.
        let body = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":{"internalServerException":{"message":"event serialization failed"}}}"#
                .to_string()
        });
        format!("{body}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shapes_match_the_converse_contract() {
        let line = EventEnvelope::new(RunEvent::ContentBlockDelta {
            delta: Delta {
                text: "hel".into(),
            },
            content_block_index: 0,
        })
        .to_line();
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(
            parsed,
            json!({"event": {"contentBlockDelta": {"delta": {"text": "hel"}, "contentBlockIndex": 0}}})
        );

        let error = EventEnvelope::new(RunEvent::InternalServerException {
            message: "boom".into(),
        })
        .to_line();
        let parsed: Value = serde_json::from_str(error.trim_end()).unwrap();
        assert_eq!(
            parsed,
            json!({"event": {"internalServerException": {"message": "boom"}}})
        );
    }

    #[test]
    fn stop_reasons_serialize_snake_case() {
        let line = EventEnvelope::new(RunEvent::MessageStop {
            stop_reason: StopReason::EndTurn,
        })
        .to_line();
        assert!(line.contains(r#""stopReason":"end_turn""#));
    }

    #[test]
    fn terminality() {
        assert!(RunEvent::MessageStop {
            stop_reason: StopReason::EndTurn
        }
        .is_terminal());
        assert!(RunEvent::InternalServerException {
            message: "x".into()
        }
        .is_terminal());
        assert!(!RunEvent::MessageStop {
            stop_reason: StopReason::ToolUse
        }
        .is_terminal());
        assert!(!RunEvent::ContentBlockDelta {
            delta: Delta { text: "t".into() },
            content_block_index: 0
        }
        .is_terminal());
    }
}
