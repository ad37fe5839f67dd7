//! Tool aggregation across the three sources.
//!
//! Order is deliberate: cached subprocess tools first, then the built-ins
//! (upload, then the optional code interpreter), then gateway tools last,
//! so local, fast-available tools register before slower network-dependent
//! ones. Aggregation never fails: every adapter failure is logged and
//! contributes zero tools. Duplicate names across sources are preserved as
//! distinct entries.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::gateway::GatewaySource;
use crate::mcp::{McpClient, McpToolAdapter, StdioTransport};
use crate::session::SessionInfo;
use crate::tool::{Tool, ToolRegistry};
use crate::tools::code_interpreter::{
    interpreter_available, CodeInterpreterConfig, CodeInterpreterTool,
};
#[cfg(feature = "aws")]
use crate::tools::storage_upload::StorageUploadTool;

/// One manifest entry: how to launch a tool server.
///
/// The subprocess inherits the ambient environment; `env` entries are applied
/// on top and win on key collision.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDefinition {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Read the server manifest, tolerating every malformation.
///
/// A missing or unreadable file, malformed JSON, or an absent `mcpServers`
/// table all yield an empty list with a logged warning; an individual entry
/// that fails to parse is skipped without dragging the others down. Entries
/// come back in the manifest's declared order.
pub fn load_manifest(path: &Path) -> Vec<(String, ServerDefinition)> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), %err, "manifest not readable; no subprocess tools");
            return Vec::new();
        }
    };

    let manifest: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), %err, "manifest is not valid JSON; no subprocess tools");
            return Vec::new();
        }
    };

    let Some(servers) = manifest.get("mcpServers").and_then(Value::as_object) else {
        warn!(path = %path.display(), "`mcpServers` not defined in manifest");
        return Vec::new();
    };

    servers
        .iter()
        .filter_map(|(name, entry)| {
            match serde_json::from_value::<ServerDefinition>(entry.clone()) {
                Ok(definition) => Some((name.clone(), definition)),
                Err(err) => {
                    error!(server = %name, %err, "invalid server entry; skipping");
                    None
                }
            }
        })
        .collect()
}

type StdioClient = Arc<Mutex<McpClient<StdioTransport>>>;

/// Aggregates tools from the subprocess manifest, the built-ins, and the
/// gateway. One manager serves one in-flight session at a time.
pub struct ToolManager {
    config: RuntimeConfig,
    gateway: GatewaySource,
    /// Subprocess result, computed at most once per manager lifetime and
    /// never invalidated.
    subprocess: OnceCell<Vec<Arc<dyn Tool>>>,
    /// Live stdio clients, kept for explicit shutdown.
    clients: Mutex<Vec<StdioClient>>,
}

impl ToolManager {
    pub fn new(config: RuntimeConfig) -> Self {
        let gateway = GatewaySource::new(config.gateway.clone());
        Self::with_gateway_source(config, gateway)
    }

    pub fn with_gateway_source(config: RuntimeConfig, gateway: GatewaySource) -> Self {
        if let Err(err) = std::fs::create_dir_all(&config.tooling.workspace_dir) {
            warn!(
                dir = %config.tooling.workspace_dir.display(),
                %err,
                "could not create workspace directory"
            );
        }
        Self {
            config,
            gateway,
            subprocess: OnceCell::new(),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Collect every available tool for one request. Never fails.
    pub async fn aggregate(&self, session: &SessionInfo) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        let subprocess = self.subprocess_tools().await;
        for tool in subprocess {
            registry.register_arc(tool.clone());
        }
        let subprocess_count = registry.len();

        #[cfg(feature = "aws")]
        registry.register(StorageUploadTool::new(
            self.config.tooling.file_bucket.clone(),
            self.config.region.clone(),
            self.config.tooling.workspace_dir.clone(),
            session.trace_id.clone(),
        ));
        #[cfg(not(feature = "aws"))]
        let _ = session;

        if self.config.tooling.code_interpreter_enabled {
            if interpreter_available() {
                registry.register(CodeInterpreterTool::new(CodeInterpreterConfig::new(
                    self.config.tooling.workspace_dir.clone(),
                )));
            } else {
                warn!("code interpreter enabled but no interpreter found on PATH");
            }
        }
        let builtin_count = registry.len() - subprocess_count;

        let gateway_tools = self.gateway.load_tools().await;
        let gateway_count = gateway_tools.len();
        for tool in gateway_tools {
            registry.register_arc(tool);
        }

        info!(
            total = registry.len(),
            subprocess = subprocess_count,
            builtin = builtin_count,
            gateway = gateway_count,
            "aggregated tools"
        );
        registry
    }

    async fn subprocess_tools(&self) -> &Vec<Arc<dyn Tool>> {
        self.subprocess
            .get_or_init(|| async { self.load_subprocess_tools().await })
            .await
    }

    async fn load_subprocess_tools(&self) -> Vec<Arc<dyn Tool>> {
        let servers = load_manifest(&self.config.tooling.manifest_path);
        let timeout = Duration::from_secs(self.config.tooling.startup_timeout_secs);

        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        for (name, definition) in servers {
            match self.start_server(&name, &definition, timeout).await {
                Ok(mut server_tools) => {
                    info!(server = %name, count = server_tools.len(), "started MCP server");
                    tools.append(&mut server_tools);
                }
                Err(err) => {
                    error!(server = %name, %err, "failed to start MCP server; skipping");
                }
            }
        }
        tools
    }

    async fn start_server(
        &self,
        name: &str,
        definition: &ServerDefinition,
        timeout: Duration,
    ) -> Result<Vec<Arc<dyn Tool>>> {
        let transport =
            StdioTransport::spawn(&definition.command, &definition.args, &definition.env)?;
        let client = Arc::new(Mutex::new(McpClient::new(transport).with_timeout(timeout)));

        let definitions = tokio::time::timeout(timeout, async {
            client.lock().await.list_tools().await
        })
        .await
        .map_err(|_| RuntimeError::Mcp(format!("server `{name}` startup timed out")))??;

        if let Some(info) = client.lock().await.server_info() {
            debug!(server = %name, advertised = %info.name, version = ?info.version, "server initialized");
        }
        self.clients.lock().await.push(client.clone());

        Ok(definitions
            .into_iter()
            .map(|definition| {
                Arc::new(McpToolAdapter::new(definition, client.clone())) as Arc<dyn Tool>
            })
            .collect())
    }

    /// Close every live subprocess client.
    pub async fn shutdown(&self) {
        let clients = std::mem::take(&mut *self.clients.lock().await);
        for client in clients {
            if let Err(err) = client.lock().await.close().await {
                warn!(%err, "failed to close MCP client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn manager_with_manifest(manifest: &Path) -> ToolManager {
        let mut config = RuntimeConfig::default();
        config.tooling.manifest_path = manifest.to_path_buf();
        config.tooling.workspace_dir = std::env::temp_dir().join("agentcore-test-ws");
        config.tooling.code_interpreter_enabled = false;
        ToolManager::new(config)
    }

    fn session() -> SessionInfo {
        SessionInfo {
            session_id: "s-1".into(),
            trace_id: "t-1".into(),
        }
    }

    #[test]
    fn missing_manifest_yields_no_servers() {
        assert!(load_manifest(Path::new("/nonexistent/mcp.json")).is_empty());
    }

    #[test]
    fn malformed_manifest_yields_no_servers() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(load_manifest(file.path()).is_empty());
    }

    #[test]
    fn missing_server_table_yields_no_servers() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"servers": {{}}}}"#).unwrap();
        assert!(load_manifest(file.path()).is_empty());
    }

    #[test]
    fn entries_come_back_in_declared_order() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{
                "zeta": {{"command": "z"}},
                "alpha": {{"command": "a", "args": ["--x"]}},
                "mid": {{"command": "m", "env": {{"KEY": "VALUE"}}}}
            }}}}"#
        )
        .unwrap();
        let servers = load_manifest(file.path());
        let names: Vec<&str> = servers.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(servers[1].1.args, vec!["--x"]);
        assert_eq!(servers[2].1.env.get("KEY").map(String::as_str), Some("VALUE"));
    }

    #[test]
    fn invalid_entry_is_skipped_not_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{
                "good": {{"command": "ok"}},
                "bad": {{"args": ["missing command"]}}
            }}}}"#
        )
        .unwrap();
        let servers = load_manifest(file.path());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].0, "good");
    }

    #[tokio::test]
    async fn aggregation_with_broken_manifest_still_has_builtins() {
        let manager = manager_with_manifest(Path::new("/nonexistent/mcp.json"));
        let registry = manager.aggregate(&session()).await;
        // The upload built-in is always registered; the interpreter is not,
        // because the fixture disables it.
        assert!(!registry.names().contains(&"execute_code".to_string()));
        #[cfg(feature = "aws")]
        assert!(registry.names().contains(&"upload_file_to_s3".to_string()));
    }

    #[tokio::test]
    async fn subprocess_result_is_memoized() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{"ghost": {{"command": "/definitely/not/a/binary"}}}}}}"#
        )
        .unwrap();
        let manager = manager_with_manifest(file.path());

        let first = manager.aggregate(&session()).await;
        // Rewrite the manifest; the cached (empty) subprocess result must
        // survive because the cache is never invalidated.
        write!(file, "{{ broken").unwrap();
        let second = manager.aggregate(&session()).await;
        assert_eq!(first.names(), second.names());
    }
}
