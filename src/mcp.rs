//! MCP (Model Context Protocol) client support.
//!
//! Tool servers speak JSON-RPC over one of two transports:
//! - **Stdio**: the server is spawned as a subprocess and driven over
//!   stdin/stdout (manifest-declared servers).
//! - **HTTP**: the server sits behind an endpoint, optionally with default
//!   headers for bearer authentication (the tool gateway).
//!
//! Every request is bounded by the client's timeout; a server that stops
//! answering surfaces as an `Mcp` error rather than a hung aggregation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::{Result, RuntimeError};
use crate::tool::Tool;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// JSON-RPC types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A request with no `id` and no expected response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Tool definition advertised by a server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and await its response.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a one-way notification; no response is read.
    async fn notify(&self, notification: JsonRpcNotification) -> Result<()>;

    /// Close the transport.
    async fn close(&self) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP transport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport that posts JSON-RPC to a streamable-HTTP MCP endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_headers(url, HashMap::new())
    }

    /// Create with default headers, e.g. `Authorization: Bearer <token>`.
    pub fn with_headers(url: impl Into<String>, headers: HashMap<String, String>) -> Result<Self> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::try_from(key)
                .map_err(|err| RuntimeError::Mcp(format!("invalid header name: {err}")))?;
            let value = reqwest::header::HeaderValue::try_from(value)
                .map_err(|err| RuntimeError::Mcp(format!("invalid header value: {err}")))?;
            header_map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(header_map)
            .build()
            .map_err(|err| RuntimeError::Mcp(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            url: url.into(),
            request_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        request.id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| RuntimeError::Mcp(format!("HTTP request failed: {err}")))?;

        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| RuntimeError::Mcp(format!("failed to parse response: {err}")))?;

        Ok(response)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|err| RuntimeError::Mcp(format!("HTTP notification failed: {err}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stdio transport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport over a spawned subprocess's stdin/stdout.
///
/// The subprocess inherits the ambient environment; per-server overrides from
/// the manifest are applied on top (override wins on key collision). The
/// child carries `kill_on_drop` so process exit reaps servers even without an
/// explicit close.
pub struct StdioTransport {
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    stdout: Arc<Mutex<Option<BufReader<ChildStdout>>>>,
    request_id: AtomicU64,
}

impl StdioTransport {
    pub fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| RuntimeError::Mcp(format!("failed to spawn `{command}`: {err}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);

        Ok(Self {
            child: Arc::new(Mutex::new(Some(child))),
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(stdout)),
            request_id: AtomicU64::new(1),
        })
    }

    async fn write_line(&self, payload: String) -> Result<()> {
        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| RuntimeError::Mcp("server stdin not available".into()))?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| RuntimeError::Mcp(format!("failed to write to server: {err}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| RuntimeError::Mcp(format!("failed to write to server: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| RuntimeError::Mcp(format!("failed to flush: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, mut request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        request.id = self.request_id.fetch_add(1, Ordering::SeqCst);
        self.write_line(serde_json::to_string(&request)?).await?;

        let mut stdout_guard = self.stdout.lock().await;
        let stdout = stdout_guard
            .as_mut()
            .ok_or_else(|| RuntimeError::Mcp("server stdout not available".into()))?;

        let mut line = String::new();
        let read = stdout
            .read_line(&mut line)
            .await
            .map_err(|err| RuntimeError::Mcp(format!("failed to read from server: {err}")))?;
        if read == 0 {
            return Err(RuntimeError::Mcp("server closed its stdout".into()));
        }

        let response: JsonRpcResponse = serde_json::from_str(&line)
            .map_err(|err| RuntimeError::Mcp(format!("failed to parse response: {err}")))?;
        Ok(response)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        self.write_line(serde_json::to_string(&notification)?).await
    }

    async fn close(&self) -> Result<()> {
        let mut child_guard = self.child.lock().await;
        if let Some(ref mut child) = *child_guard {
            child
                .kill()
                .await
                .map_err(|err| RuntimeError::Mcp(format!("failed to kill server: {err}")))?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

pub struct McpClient<T: McpTransport> {
    transport: T,
    timeout: Duration,
    initialized: bool,
    server_info: Option<ServerInfo>,
}

impl<T: McpTransport> McpClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            initialized: false,
            server_info: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 0,
            method: method.to_string(),
            params,
        };

        let response = tokio::time::timeout(self.timeout, self.transport.send(request))
            .await
            .map_err(|_| RuntimeError::Mcp(format!("`{method}` timed out")))??;

        if let Some(error) = response.error {
            return Err(RuntimeError::Mcp(format!(
                "`{method}` failed: {}",
                error.message
            )));
        }
        Ok(response.result.unwrap_or_default())
    }

    /// Initialize the connection; idempotent.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let result = self
            .request(
                "initialize",
                Some(serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await?;

        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|err| RuntimeError::Mcp(format!("failed to parse initialize result: {err}")))?;

        self.server_info = Some(result.server_info);
        self.initialized = true;

        self.transport
            .notify(JsonRpcNotification {
                jsonrpc: "2.0".to_string(),
                method: "notifications/initialized".to_string(),
                params: None,
            })
            .await?;

        Ok(())
    }

    pub async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>> {
        self.initialize().await?;
        let result = self.request("tools/list", None).await?;
        let result: ListToolsResult = serde_json::from_value(result)
            .map_err(|err| RuntimeError::Mcp(format!("failed to parse tools/list result: {err}")))?;
        Ok(result.tools)
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<CallToolResult> {
        self.initialize().await?;
        let result = self
            .request(
                "tools/call",
                Some(serde_json::json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|err| RuntimeError::Mcp(format!("failed to parse tools/call result: {err}")))?;
        Ok(result)
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Exposes one server-advertised tool through the crate's `Tool` trait,
/// routing calls back over the shared client.
pub struct McpToolAdapter<T: McpTransport + 'static> {
    name: String,
    description: String,
    parameters: Value,
    client: Arc<Mutex<McpClient<T>>>,
    remote_name: String,
}

impl<T: McpTransport + 'static> McpToolAdapter<T> {
    pub fn new(definition: McpToolDefinition, client: Arc<Mutex<McpClient<T>>>) -> Self {
        let description = definition
            .description
            .unwrap_or_else(|| format!("MCP tool: {}", definition.name));
        Self {
            name: definition.name.clone(),
            description,
            parameters: definition.input_schema,
            client,
            remote_name: definition.name,
        }
    }
}

#[async_trait]
impl<T: McpTransport + 'static> Tool for McpToolAdapter<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Option<Value> {
        Some(self.parameters.clone())
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let mut client = self.client.lock().await;
        let result = client.call_tool(&self.remote_name, input).await?;

        let mut text_content = Vec::new();
        let mut images = Vec::new();
        for item in &result.content {
            match item {
                ContentItem::Text { text } => text_content.push(text.clone()),
                ContentItem::Image { data, mime_type } => images.push(serde_json::json!({
                    "type": "image",
                    "data": data,
                    "mimeType": mime_type.clone().unwrap_or_else(|| "image/png".to_string())
                })),
                ContentItem::Resource { resource } => {
                    text_content.push(format!("[Resource: {resource}]"));
                }
            }
        }

        if result.is_error {
            return Ok(serde_json::json!({
                "error": true,
                "content": text_content.join("\n"),
            }));
        }

        if images.is_empty() {
            Ok(serde_json::json!({ "content": text_content.join("\n") }))
        } else {
            Ok(serde_json::json!({
                "content": text_content.join("\n"),
                "images": images,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: 1,
            method: "tools/list".to_string(),
            params: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""method":"tools/list""#));
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: "notifications/initialized".to_string(),
            params: None,
        };
        let json = serde_json::to_string(&notification).unwrap();
        assert!(!json.contains(r#""id""#));
    }

    #[test]
    fn response_deserialization() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
        let response: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.id, 1);
        assert!(response.result.is_some());
        assert!(response.error.is_none());
    }

    #[test]
    fn tool_definition_deserialization() {
        let json = r#"{
            "name": "read_file",
            "description": "Read a file from disk",
            "inputSchema": {
                "type": "object",
                "properties": { "path": {"type": "string"} },
                "required": ["path"]
            }
        }"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.description.as_deref(), Some("Read a file from disk"));
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn rejects_invalid_header() {
        let mut headers = HashMap::new();
        headers.insert("bad header\n".to_string(), "x".to_string());
        assert!(HttpTransport::with_headers("http://localhost", headers).is_err());
    }
}
