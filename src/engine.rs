//! The run loop.
//!
//! One run binds a model client, an aggregated tool registry, and the
//! session's iteration budget. Each reasoning step starts with an explicit
//! budget check, streams the model reply, surfaces text deltas as they
//! arrive, then either finishes or executes the requested tools and loops.
//!
//! Tool-level failures become error-status tool results and the run
//! continues; everything else propagates to the controller, which frames it
//! as the terminal error event. Emission stops as soon as the receiver goes
//! away, so a disconnected caller cancels the run at the next event.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::events::{Delta, RunEvent, StopReason};
use crate::llm::{ModelChunk, ModelClient};
use crate::message::{
    ContentBlock, Message, Role, ToolResultBlock, ToolResultStatus, ToolUseBlock,
};
use crate::session::IterationBudget;
use crate::tool::ToolRegistry;

pub struct RunEngine {
    model: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    system_prompt: String,
}

struct PendingToolUse {
    index: usize,
    tool_use_id: String,
    name: String,
    input_json: String,
}

/// Forward one event; `false` means the caller disconnected.
async fn emit(events: &mpsc::Sender<RunEvent>, event: RunEvent) -> bool {
    events.send(event).await.is_ok()
}

impl RunEngine {
    pub fn new(model: Arc<dyn ModelClient>, tools: ToolRegistry, system_prompt: String) -> Self {
        Self {
            model,
            tools,
            system_prompt,
        }
    }

    pub async fn run(
        &self,
        mut transcript: Vec<Message>,
        budget: &mut IterationBudget,
        events: &mpsc::Sender<RunEvent>,
    ) -> Result<()> {
        let descriptions = self.tools.describe();

        loop {
            budget.step()?;

            let mut stream = self
                .model
                .converse_stream(&self.system_prompt, &transcript, &descriptions)
                .await?;

            if !emit(
                events,
                RunEvent::MessageStart {
                    role: Role::Assistant,
                },
            )
            .await
            {
                return Ok(());
            }

            let mut text = String::new();
            let mut pending: Vec<PendingToolUse> = Vec::new();
            let mut stop_reason = None;

            while let Some(chunk) = stream.next().await {
                match chunk? {
                    ModelChunk::TextDelta { index, text: delta } => {
                        text.push_str(&delta);
                        let event = RunEvent::ContentBlockDelta {
                            delta: Delta { text: delta },
                            content_block_index: index,
                        };
                        if !emit(events, event).await {
                            return Ok(());
                        }
                    }
                    ModelChunk::ToolUseStart {
                        index,
                        tool_use_id,
                        name,
                    } => {
                        pending.push(PendingToolUse {
                            index,
                            tool_use_id,
                            name,
                            input_json: String::new(),
                        });
                    }
                    ModelChunk::ToolUseDelta {
                        index,
                        input_fragment,
                    } => {
                        if let Some(entry) = pending.iter_mut().rev().find(|p| p.index == index) {
                            entry.input_json.push_str(&input_fragment);
                        }
                    }
                    ModelChunk::BlockStop { index } => {
                        let event = RunEvent::ContentBlockStop {
                            content_block_index: index,
                        };
                        if !emit(events, event).await {
                            return Ok(());
                        }
                    }
                    ModelChunk::Stop(reason) => stop_reason = Some(reason),
                }
            }

            let stop_reason = stop_reason.unwrap_or(StopReason::EndTurn);
            if !emit(events, RunEvent::MessageStop { stop_reason }).await {
                return Ok(());
            }

            // Fold the streamed reply back into the transcript.
            let mut assistant_content = Vec::new();
            if !text.is_empty() {
                assistant_content.push(ContentBlock::Text { text });
            }
            let mut calls = Vec::new();
            for entry in &pending {
                let input: Value = if entry.input_json.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&entry.input_json)
                        .unwrap_or_else(|_| Value::String(entry.input_json.clone()))
                };
                assistant_content.push(ContentBlock::ToolUse {
                    tool_use: ToolUseBlock {
                        tool_use_id: entry.tool_use_id.clone(),
                        name: entry.name.clone(),
                        input: input.clone(),
                    },
                });
                calls.push((entry.tool_use_id.clone(), entry.name.clone(), input));
            }
            if !assistant_content.is_empty() {
                transcript.push(Message::assistant(assistant_content));
            }

            if stop_reason != StopReason::ToolUse || calls.is_empty() {
                return Ok(());
            }

            let mut result_blocks = Vec::new();
            for (tool_use_id, name, input) in calls {
                let event = RunEvent::ToolUse {
                    tool_use_id: tool_use_id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                };
                if !emit(events, event).await {
                    return Ok(());
                }

                let (status, content) = match self.tools.call(&name, input).await {
                    Ok(value) => (ToolResultStatus::Success, value),
                    Err(err) => {
                        warn!(tool = %name, %err, "tool invocation failed");
                        (ToolResultStatus::Error, json!({ "error": err.to_string() }))
                    }
                };

                let event = RunEvent::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    name,
                    status,
                    content: content.clone(),
                };
                if !emit(events, event).await {
                    return Ok(());
                }

                result_blocks.push(ContentBlock::ToolResult {
                    tool_result: ToolResultBlock {
                        tool_use_id,
                        content,
                        status,
                    },
                });
            }
            transcript.push(Message {
                role: Role::User,
                content: result_blocks,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::llm::ScriptedModel;
    use crate::tool::Tool;
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its input"
        }

        async fn call(&self, input: Value) -> Result<Value> {
            Ok(input)
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn call(&self, _input: Value) -> Result<Value> {
            Err(RuntimeError::InvalidInput("bad arguments".into()))
        }
    }

    async fn collect(
        engine: RunEngine,
        budget: &mut IterationBudget,
    ) -> (Result<()>, Vec<RunEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let transcript = vec![Message::user_text("hi")];
        let result = engine.run(transcript, budget, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn plain_text_run() {
        let model = ScriptedModel::new(vec![ScriptedModel::text_turn(&["Hel", "lo"])]);
        let engine = RunEngine::new(model, ToolRegistry::new(), "system".into());
        let mut budget = IterationBudget::new(20);

        let (result, events) = collect(engine, &mut budget).await;
        result.unwrap();

        assert!(matches!(events[0], RunEvent::MessageStart { .. }));
        assert!(matches!(
            events.last(),
            Some(RunEvent::MessageStop {
                stop_reason: StopReason::EndTurn
            })
        ));
        let text: String = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::ContentBlockDelta { delta, .. } => Some(delta.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn tool_run_invokes_and_continues() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_turn("t-1", "echo", r#"{"x": 1}"#),
            ScriptedModel::text_turn(&["done"]),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let engine = RunEngine::new(model, tools, "system".into());
        let mut budget = IterationBudget::new(20);

        let (result, events) = collect(engine, &mut budget).await;
        result.unwrap();

        let tool_use = events
            .iter()
            .find(|event| matches!(event, RunEvent::ToolUse { .. }))
            .unwrap();
        if let RunEvent::ToolUse { name, input, .. } = tool_use {
            assert_eq!(name, "echo");
            assert_eq!(input["x"], 1);
        }
        let tool_result = events
            .iter()
            .find(|event| matches!(event, RunEvent::ToolResult { .. }))
            .unwrap();
        if let RunEvent::ToolResult {
            status, content, ..
        } = tool_result
        {
            assert_eq!(*status, ToolResultStatus::Success);
            assert_eq!(content["x"], 1);
        }
        assert!(matches!(
            events.last(),
            Some(RunEvent::MessageStop {
                stop_reason: StopReason::EndTurn
            })
        ));
        assert_eq!(budget.used(), 2);
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_result_not_abort() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_turn("t-1", "broken", "{}"),
            ScriptedModel::text_turn(&["recovered"]),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(BrokenTool);
        let engine = RunEngine::new(model, tools, "system".into());
        let mut budget = IterationBudget::new(20);

        let (result, events) = collect(engine, &mut budget).await;
        result.unwrap();

        let tool_result = events
            .iter()
            .find(|event| matches!(event, RunEvent::ToolResult { .. }))
            .unwrap();
        if let RunEvent::ToolResult { status, .. } = tool_result {
            assert_eq!(*status, ToolResultStatus::Error);
        }
        // The run kept going to a normal completion.
        assert!(matches!(
            events.last(),
            Some(RunEvent::MessageStop {
                stop_reason: StopReason::EndTurn
            })
        ));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_turn("t-1", "ghost", "{}"),
            ScriptedModel::text_turn(&["ok"]),
        ]);
        let engine = RunEngine::new(model, ToolRegistry::new(), "system".into());
        let mut budget = IterationBudget::new(20);

        let (result, events) = collect(engine, &mut budget).await;
        result.unwrap();
        let tool_result = events
            .iter()
            .find(|event| matches!(event, RunEvent::ToolResult { .. }))
            .unwrap();
        if let RunEvent::ToolResult { status, content, .. } = tool_result {
            assert_eq!(*status, ToolResultStatus::Error);
            assert!(content["error"].as_str().unwrap().contains("ghost"));
        }
    }

    #[tokio::test]
    async fn iteration_ceiling_aborts_the_run() {
        // The model keeps requesting tools; a ceiling of 2 allows two model
        // calls and fails on the third.
        let model = ScriptedModel::new(vec![
            ScriptedModel::tool_turn("t-1", "echo", "{}"),
            ScriptedModel::tool_turn("t-2", "echo", "{}"),
            ScriptedModel::tool_turn("t-3", "echo", "{}"),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let engine = RunEngine::new(model, tools, "system".into());
        let mut budget = IterationBudget::new(2);

        let (result, _events) = collect(engine, &mut budget).await;
        assert!(result.unwrap_err().is_iteration_limit());
    }

    #[tokio::test]
    async fn mid_stream_model_error_propagates_after_partial_events() {
        let model = ScriptedModel::new(vec![vec![
            Ok(ModelChunk::TextDelta {
                index: 0,
                text: "par".into(),
            }),
            Ok(ModelChunk::TextDelta {
                index: 0,
                text: "tial".into(),
            }),
            Err(RuntimeError::LanguageModel("connection reset".into())),
        ]]);
        let engine = RunEngine::new(model, ToolRegistry::new(), "system".into());
        let mut budget = IterationBudget::new(20);

        let (result, events) = collect(engine, &mut budget).await;
        assert!(matches!(result, Err(RuntimeError::LanguageModel(_))));

        let deltas = events
            .iter()
            .filter(|event| matches!(event, RunEvent::ContentBlockDelta { .. }))
            .count();
        assert_eq!(deltas, 2);
    }
}
