//! The streaming execution controller.
//!
//! `AgentRuntime` wires the model factory, the tool manager, and the
//! session's iteration budget into one run and turns it into a stream of
//! NDJSON lines. Any failure anywhere (setup, normalization, mid-stream)
//! is caught once here, logged in full, and converted into exactly one
//! terminal error line; the caller never sees a raw failure or a silently
//! truncated stream.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::config::RuntimeConfig;
use crate::engine::RunEngine;
use crate::error::{Result, RuntimeError};
use crate::events::{EventEnvelope, RunEvent};
use crate::llm::{ModelFactory, ModelSettings};
use crate::message::{normalize_messages, normalize_prompt, PromptInput};
use crate::session::SessionContext;
use crate::tooling::ToolManager;

const BASE_SYSTEM_PROMPT: &str =
    "You are a helpful agent. Write any generated files under the workspace directory \
     and use the available tools to share them with the caller.";

/// Model identity and cache policies as supplied by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    #[serde(rename = "modelId", default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(rename = "cachePromptPolicy", default = "default_cache_policy")]
    pub cache_prompt_policy: String,
    #[serde(rename = "cacheToolsPolicy", default = "default_cache_policy")]
    pub cache_tools_policy: String,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            model_id: None,
            region: None,
            cache_prompt_policy: default_cache_policy(),
            cache_tools_policy: default_cache_policy(),
        }
    }
}

fn default_cache_policy() -> String {
    "default".into()
}

#[derive(Debug, Deserialize, Default)]
pub struct InvocationRequest {
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub prompt: PromptInput,
    #[serde(default)]
    pub model: ModelInfo,
}

fn resolve_model_settings(info: &ModelInfo, fallback_region: &str) -> Result<ModelSettings> {
    let model_id = info
        .model_id
        .clone()
        .ok_or_else(|| RuntimeError::InvalidInput("request is missing `model.modelId`".into()))?;
    Ok(ModelSettings {
        model_id,
        region: info
            .region
            .clone()
            .unwrap_or_else(|| fallback_region.to_string()),
        cache_prompt: info.cache_prompt_policy.clone(),
        cache_tools: info.cache_tools_policy.clone(),
    })
}

#[derive(Clone)]
pub struct AgentRuntime {
    config: Arc<RuntimeConfig>,
    tools: Arc<ToolManager>,
    models: Arc<dyn ModelFactory>,
}

impl AgentRuntime {
    #[cfg(feature = "aws")]
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_model_factory(config, Arc::new(crate::llm::BedrockFactory))
    }

    pub fn with_model_factory(config: RuntimeConfig, models: Arc<dyn ModelFactory>) -> Self {
        let tools = Arc::new(ToolManager::new(config.clone()));
        Self {
            config: Arc::new(config),
            tools,
            models,
        }
    }

    /// Full dependency injection, used by tests to stand in a gateway or a
    /// pre-built tool manager.
    pub fn with_parts(
        config: RuntimeConfig,
        tools: Arc<ToolManager>,
        models: Arc<dyn ModelFactory>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            tools,
            models,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Bind a session, producing the context the next run will consume.
    /// Every bind starts from a zero iteration count.
    pub fn bind_session(
        &self,
        session_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> SessionContext {
        SessionContext::new(session_id, trace_id, self.config.agent.max_iterations)
    }

    pub async fn shutdown(&self) {
        self.tools.shutdown().await;
    }

    /// Run one request, yielding `{"event":{...}}` lines as they are
    /// produced. The stream always ends with either the run's own completion
    /// events or exactly one synthesized error line. Dropping the stream
    /// cancels the run at its next event.
    pub fn process_request_streaming(
        &self,
        ctx: SessionContext,
        request: InvocationRequest,
    ) -> ReceiverStream<String> {
        let (line_tx, line_rx) = mpsc::channel::<String>(64);
        let runtime = self.clone();

        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::channel::<RunEvent>(64);

            let forward_tx = line_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if forward_tx
                        .send(EventEnvelope::new(event).to_line())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });

            let session_id = ctx.info.session_id.clone();
            let result = runtime.execute(ctx, request, event_tx).await;
            let _ = forwarder.await;

            if let Err(err) = result {
                error!(session = %session_id, %err, "error processing agent request");
                let event = RunEvent::InternalServerException {
                    message: format!("An error occurred while processing your request: {err}"),
                };
                let _ = line_tx.send(EventEnvelope::new(event).to_line()).await;
            }
        });

        ReceiverStream::new(line_rx)
    }

    async fn execute(
        &self,
        mut ctx: SessionContext,
        request: InvocationRequest,
        events: mpsc::Sender<RunEvent>,
    ) -> Result<()> {
        let settings = resolve_model_settings(&request.model, &self.config.region)?;
        let system_prompt = self.compose_system_prompt(request.system_prompt.as_deref());
        let tools = self.tools.aggregate(&ctx.info).await;

        let mut transcript = normalize_messages(request.messages)?;
        if let Some(message) = normalize_prompt(request.prompt) {
            transcript.push(message);
        }
        if transcript.is_empty() {
            return Err(RuntimeError::InvalidInput(
                "request contained no prompt and no messages".into(),
            ));
        }

        let model = self.models.client(&settings).await?;
        let engine = RunEngine::new(model, tools, system_prompt);
        engine.run(transcript, &mut ctx.iterations, &events).await
    }

    fn compose_system_prompt(&self, caller_prompt: Option<&str>) -> String {
        let base = self
            .config
            .agent
            .base_system_prompt
            .as_deref()
            .unwrap_or(BASE_SYSTEM_PROMPT);
        let mut prompt = format!(
            "{base}\nThe workspace directory is {}.",
            self.config.tooling.workspace_dir.display()
        );
        if let Some(extra) = caller_prompt {
            if !extra.trim().is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(extra);
            }
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_settings_require_an_id() {
        let err = resolve_model_settings(&ModelInfo::default(), "us-east-1").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidInput(_)));

        let info = ModelInfo {
            model_id: Some("anthropic.claude-3-5-sonnet-20241022-v2:0".into()),
            ..ModelInfo::default()
        };
        let settings = resolve_model_settings(&info, "eu-west-1").unwrap();
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.cache_prompt, "default");
    }

    #[test]
    fn request_region_wins_over_fallback() {
        let info = ModelInfo {
            model_id: Some("m".into()),
            region: Some("ap-northeast-1".into()),
            ..ModelInfo::default()
        };
        let settings = resolve_model_settings(&info, "us-east-1").unwrap();
        assert_eq!(settings.region, "ap-northeast-1");
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: InvocationRequest = serde_json::from_str(
            r#"{"prompt": "hello", "model": {"modelId": "m-1", "region": "us-west-2"}}"#,
        )
        .unwrap();
        assert!(request.messages.is_empty());
        assert!(request.system_prompt.is_none());
        assert_eq!(request.model.model_id.as_deref(), Some("m-1"));
        assert_eq!(request.model.cache_prompt_policy, "default");
    }
}
