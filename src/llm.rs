//! Language model boundary.
//!
//! The runtime talks to the model through `ModelClient`: bind a system
//! prompt, transcript, and tool specs, get back a lazy stream of chunks. The
//! reasoning loop itself lives in `engine`; this module only adapts
//! providers. `BedrockClient` is the production implementation over the
//! Converse streaming API; `ScriptedModel` is a deterministic stand-in for
//! tests and demos.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::Stream;

use crate::error::{Result, RuntimeError};
use crate::events::StopReason;
use crate::message::Message;
use crate::tool::ToolDescription;

/// Model identity and caching behavior for one run, resolved from the
/// request before anything else happens.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model_id: String,
    pub region: String,
    pub cache_prompt: String,
    pub cache_tools: String,
}

/// One unit of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta { index: usize, text: String },
    ToolUseStart {
        index: usize,
        tool_use_id: String,
        name: String,
    },
    ToolUseDelta { index: usize, input_fragment: String },
    BlockStop { index: usize },
    Stop(StopReason),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk>> + Send>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn converse_stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelStream>;
}

/// Builds a client for the resolved settings; the indirection lets tests
/// inject a scripted model under the real controller.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn client(&self, settings: &ModelSettings) -> Result<Arc<dyn ModelClient>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Bedrock
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "aws")]
pub use bedrock::{BedrockClient, BedrockFactory};

#[cfg(feature = "aws")]
mod bedrock {
    use super::*;

    use aws_config::{BehaviorVersion, Region};
    use aws_sdk_bedrockruntime::types as bt;
    use aws_smithy_types::error::display::DisplayErrorContext;
    use aws_smithy_types::{Document, Number};
    use futures::StreamExt;

    use crate::message::{ContentBlock, Role, ToolResultStatus};

    pub struct BedrockClient {
        client: aws_sdk_bedrockruntime::Client,
        settings: ModelSettings,
    }

    impl BedrockClient {
        /// Resolve credentials and region for this run's settings. The
        /// config chain is loaded per client, mirroring the per-request
        /// session the runtime is deployed with.
        pub async fn new(settings: ModelSettings) -> Self {
            let config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(settings.region.clone()))
                .load()
                .await;
            Self {
                client: aws_sdk_bedrockruntime::Client::new(&config),
                settings,
            }
        }
    }

    pub struct BedrockFactory;

    #[async_trait]
    impl ModelFactory for BedrockFactory {
        async fn client(&self, settings: &ModelSettings) -> Result<Arc<dyn ModelClient>> {
            Ok(Arc::new(BedrockClient::new(settings.clone()).await))
        }
    }

    fn build_err(err: impl std::fmt::Display) -> RuntimeError {
        RuntimeError::LanguageModel(format!("invalid model payload: {err}"))
    }

    pub(crate) fn value_to_document(value: &serde_json::Value) -> Document {
        match value {
            serde_json::Value::Null => Document::Null,
            serde_json::Value::Bool(b) => Document::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Document::Number(Number::PosInt(u))
                } else if let Some(i) = n.as_i64() {
                    Document::Number(Number::NegInt(i))
                } else {
                    Document::Number(Number::Float(n.as_f64().unwrap_or(0.0)))
                }
            }
            serde_json::Value::String(s) => Document::String(s.clone()),
            serde_json::Value::Array(items) => {
                Document::Array(items.iter().map(value_to_document).collect())
            }
            serde_json::Value::Object(map) => Document::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), value_to_document(v)))
                    .collect(),
            ),
        }
    }

    fn to_bedrock_role(role: Role) -> bt::ConversationRole {
        match role {
            Role::User => bt::ConversationRole::User,
            Role::Assistant => bt::ConversationRole::Assistant,
        }
    }

    fn to_bedrock_block(block: &ContentBlock) -> Result<bt::ContentBlock> {
        match block {
            ContentBlock::Text { text } => Ok(bt::ContentBlock::Text(text.clone())),
            ContentBlock::ToolUse { tool_use } => {
                let built = bt::ToolUseBlock::builder()
                    .tool_use_id(&tool_use.tool_use_id)
                    .name(&tool_use.name)
                    .input(value_to_document(&tool_use.input))
                    .build()
                    .map_err(build_err)?;
                Ok(bt::ContentBlock::ToolUse(built))
            }
            ContentBlock::ToolResult { tool_result } => {
                let status = match tool_result.status {
                    ToolResultStatus::Success => bt::ToolResultStatus::Success,
                    ToolResultStatus::Error => bt::ToolResultStatus::Error,
                };
                let built = bt::ToolResultBlock::builder()
                    .tool_use_id(&tool_result.tool_use_id)
                    .content(bt::ToolResultContentBlock::Json(value_to_document(
                        &tool_result.content,
                    )))
                    .status(status)
                    .build()
                    .map_err(build_err)?;
                Ok(bt::ContentBlock::ToolResult(built))
            }
        }
    }

    fn to_bedrock_messages(messages: &[Message]) -> Result<Vec<bt::Message>> {
        messages
            .iter()
            .map(|message| {
                let content = message
                    .content
                    .iter()
                    .map(to_bedrock_block)
                    .collect::<Result<Vec<_>>>()?;
                bt::Message::builder()
                    .role(to_bedrock_role(message.role))
                    .set_content(Some(content))
                    .build()
                    .map_err(build_err)
            })
            .collect()
    }

    fn cache_point() -> Result<bt::CachePointBlock> {
        bt::CachePointBlock::builder()
            .r#type(bt::CachePointType::Default)
            .build()
            .map_err(build_err)
    }

    fn to_tool_config(
        tools: &[ToolDescription],
        cache_tools: &str,
    ) -> Result<Option<bt::ToolConfiguration>> {
        if tools.is_empty() {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(tools.len() + 1);
        for tool in tools {
            let schema = tool
                .parameters
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
            let spec = bt::ToolSpecification::builder()
                .name(&tool.name)
                .description(&tool.description)
                .input_schema(bt::ToolInputSchema::Json(value_to_document(&schema)))
                .build()
                .map_err(build_err)?;
            entries.push(bt::Tool::ToolSpec(spec));
        }
        if cache_tools == "default" {
            entries.push(bt::Tool::CachePoint(cache_point()?));
        }
        let config = bt::ToolConfiguration::builder()
            .set_tools(Some(entries))
            .build()
            .map_err(build_err)?;
        Ok(Some(config))
    }

    fn map_stop_reason(reason: &bt::StopReason) -> StopReason {
        match reason {
            bt::StopReason::EndTurn => StopReason::EndTurn,
            bt::StopReason::ToolUse => StopReason::ToolUse,
            bt::StopReason::MaxTokens => StopReason::MaxTokens,
            bt::StopReason::StopSequence => StopReason::StopSequence,
            bt::StopReason::GuardrailIntervened => StopReason::GuardrailIntervened,
            bt::StopReason::ContentFiltered => StopReason::ContentFiltered,
            _ => StopReason::EndTurn,
        }
    }

    fn map_stream_event(event: bt::ConverseStreamOutput) -> Option<ModelChunk> {
        match event {
            bt::ConverseStreamOutput::ContentBlockStart(ev) => {
                let index = ev.content_block_index() as usize;
                match ev.start() {
                    Some(bt::ContentBlockStart::ToolUse(start)) => Some(ModelChunk::ToolUseStart {
                        index,
                        tool_use_id: start.tool_use_id().to_string(),
                        name: start.name().to_string(),
                    }),
                    _ => None,
                }
            }
            bt::ConverseStreamOutput::ContentBlockDelta(ev) => {
                let index = ev.content_block_index() as usize;
                match ev.delta() {
                    Some(bt::ContentBlockDelta::Text(text)) => Some(ModelChunk::TextDelta {
                        index,
                        text: text.clone(),
                    }),
                    Some(bt::ContentBlockDelta::ToolUse(delta)) => {
                        Some(ModelChunk::ToolUseDelta {
                            index,
                            input_fragment: delta.input().to_string(),
                        })
                    }
                    _ => None,
                }
            }
            bt::ConverseStreamOutput::ContentBlockStop(ev) => Some(ModelChunk::BlockStop {
                index: ev.content_block_index() as usize,
            }),
            bt::ConverseStreamOutput::MessageStop(ev) => {
                Some(ModelChunk::Stop(map_stop_reason(ev.stop_reason())))
            }
            // messageStart and metadata frames carry nothing the engine needs.
            _ => None,
        }
    }

    #[async_trait]
    impl ModelClient for BedrockClient {
        async fn converse_stream(
            &self,
            system: &str,
            messages: &[Message],
            tools: &[ToolDescription],
        ) -> Result<ModelStream> {
            let mut system_blocks = vec![bt::SystemContentBlock::Text(system.to_string())];
            if self.settings.cache_prompt == "default" {
                system_blocks.push(bt::SystemContentBlock::CachePoint(cache_point()?));
            }

            let response = self
                .client
                .converse_stream()
                .model_id(&self.settings.model_id)
                .set_system(Some(system_blocks))
                .set_messages(Some(to_bedrock_messages(messages)?))
                .set_tool_config(to_tool_config(tools, &self.settings.cache_tools)?)
                .send()
                .await
                .map_err(|err| {
                    RuntimeError::LanguageModel(format!(
                        "converse_stream request failed: {}",
                        DisplayErrorContext(&err)
                    ))
                })?;

            let stream = futures::stream::unfold(Some(response.stream), |state| async move {
                let mut receiver = state?;
                match receiver.recv().await {
                    Ok(Some(event)) => Some((Ok(map_stream_event(event)), Some(receiver))),
                    Ok(None) => None,
                    Err(err) => Some((
                        Err(RuntimeError::LanguageModel(format!(
                            "converse stream error: {}",
                            DisplayErrorContext(&err)
                        ))),
                        None,
                    )),
                }
            })
            .filter_map(|item| async move {
                match item {
                    Ok(Some(chunk)) => Some(Ok(chunk)),
                    Ok(None) => None,
                    Err(err) => Some(Err(err)),
                }
            });

            Ok(Box::pin(stream))
        }
    }

}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted model (tests and demos)
// ─────────────────────────────────────────────────────────────────────────────

/// A deterministic model that replays scripted chunk sequences, one sequence
/// per `converse_stream` call.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<Result<ModelChunk>>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Vec<Result<ModelChunk>>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
        })
    }

    /// A turn that streams `pieces` as text deltas and ends the message.
    pub fn text_turn(pieces: &[&str]) -> Vec<Result<ModelChunk>> {
        let mut chunks: Vec<Result<ModelChunk>> = pieces
            .iter()
            .map(|piece| {
                Ok(ModelChunk::TextDelta {
                    index: 0,
                    text: (*piece).to_string(),
                })
            })
            .collect();
        chunks.push(Ok(ModelChunk::BlockStop { index: 0 }));
        chunks.push(Ok(ModelChunk::Stop(StopReason::EndTurn)));
        chunks
    }

    /// A turn that requests a single tool invocation.
    pub fn tool_turn(tool_use_id: &str, name: &str, input: &str) -> Vec<Result<ModelChunk>> {
        vec![
            Ok(ModelChunk::ToolUseStart {
                index: 0,
                tool_use_id: tool_use_id.to_string(),
                name: name.to_string(),
            }),
            Ok(ModelChunk::ToolUseDelta {
                index: 0,
                input_fragment: input.to_string(),
            }),
            Ok(ModelChunk::BlockStop { index: 0 }),
            Ok(ModelChunk::Stop(StopReason::ToolUse)),
        ]
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn converse_stream(
        &self,
        _system: &str,
        _messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<ModelStream> {
        let turn = self
            .turns
            .lock()
            .expect("scripted model poisoned")
            .pop_front()
            .ok_or_else(|| {
                RuntimeError::LanguageModel("ScriptedModel ran out of scripted turns".into())
            })?;
        Ok(Box::pin(futures::stream::iter(turn)))
    }
}

/// Factory that hands the same scripted model to every run.
pub struct ScriptedFactory(pub Arc<ScriptedModel>);

#[async_trait]
impl ModelFactory for ScriptedFactory {
    async fn client(&self, _settings: &ModelSettings) -> Result<Arc<dyn ModelClient>> {
        Ok(self.0.clone())
    }
}
