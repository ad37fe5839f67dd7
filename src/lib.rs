//! Streaming conversational-agent runtime.
//!
//! The crate wires four pieces into one request pipeline:
//! - Tool aggregation across MCP subprocess servers (`tooling`), an
//!   authenticated HTTP gateway (`gateway`), and local built-ins (`tools`).
//! - A hard iteration ceiling on the agent's reasoning loop (`session`).
//! - A run engine binding model, tools, and budget (`engine`, `llm`).
//! - A streaming controller that frames every outcome, success or failure,
//!   as a well-formed NDJSON event stream (`runtime`, `events`).

mod config;
mod engine;
mod error;
mod events;
mod gateway;
mod llm;
mod mcp;
mod message;
mod runtime;
#[cfg(feature = "server")]
pub mod server;
mod session;
mod telemetry;
mod tool;
mod tooling;
mod tools;

pub use config::{AgentConfig, GatewayConfig, RuntimeConfig, ServerConfig, ToolingConfig};
pub use engine::RunEngine;
pub use error::{Result, RuntimeError};
pub use events::{Delta, EventEnvelope, RunEvent, StopReason};
pub use gateway::{CredentialProvider, GatewaySource, OAuthClientCredentials};
#[cfg(feature = "aws")]
pub use llm::{BedrockClient, BedrockFactory};
pub use llm::{
    ModelChunk, ModelClient, ModelFactory, ModelSettings, ModelStream, ScriptedFactory,
    ScriptedModel,
};
pub use mcp::{
    HttpTransport, McpClient, McpToolAdapter, McpToolDefinition, McpTransport, StdioTransport,
};
pub use message::{
    normalize_messages, normalize_prompt, ContentBlock, Message, PromptInput, Role,
    ToolResultBlock, ToolResultStatus, ToolUseBlock,
};
pub use runtime::{AgentRuntime, InvocationRequest, ModelInfo};
pub use session::{IterationBudget, SessionContext, SessionInfo};
pub use telemetry::init_tracing;
pub use tool::{Tool, ToolDescription, ToolRegistry};
pub use tooling::{load_manifest, ServerDefinition, ToolManager};
pub use tools::code_interpreter::{
    interpreter_available, CodeInterpreterConfig, CodeInterpreterTool,
};
#[cfg(feature = "aws")]
pub use tools::storage_upload::StorageUploadTool;
pub use tools::validate_workspace_path;
