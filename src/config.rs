use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

/// Settings for the tool sources: the subprocess manifest, the workspace the
/// built-in tools operate in, and the upload bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolingConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    /// Bound on subprocess server startup and on every tool-list query.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub code_interpreter_enabled: bool,
    /// Destination bucket for the upload built-in. Unset degrades the tool
    /// to a local-path reply.
    #[serde(default)]
    pub file_bucket: Option<String>,
}

impl Default for ToolingConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            workspace_dir: default_workspace_dir(),
            startup_timeout_secs: default_startup_timeout_secs(),
            code_interpreter_enabled: true,
            file_bucket: None,
        }
    }
}

fn default_manifest_path() -> PathBuf {
    "mcp.json".into()
}

fn default_workspace_dir() -> PathBuf {
    "/tmp/ws".into()
}

fn default_startup_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Remote tool gateway settings. Every field is individually optional; an
/// unset `url` disables the source entirely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_provider_name")]
    pub provider_name: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_exchange_timeout_secs")]
    pub exchange_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            provider_name: default_provider_name(),
            scope: None,
            token_url: None,
            client_id: None,
            client_secret: None,
            exchange_timeout_secs: default_exchange_timeout_secs(),
        }
    }
}

fn default_provider_name() -> String {
    "agentcore-identity-for-gateway".into()
}

fn default_exchange_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Hard ceiling on reasoning steps per session.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Prepended to every caller-supplied system prompt.
    #[serde(default)]
    pub base_system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            base_system_prompt: None,
        }
    }
}

fn default_max_iterations() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tooling: ToolingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tooling: ToolingConfig::default(),
            gateway: GatewayConfig::default(),
            agent: AgentConfig::default(),
            region: default_region(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".into()
}

impl RuntimeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|err| RuntimeError::Config(format!("failed to parse configuration: {err}")))?;
        Ok(cfg)
    }

    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// Built-in defaults plus environment overrides. This is what a deployed
    /// runtime uses: the whole external contract fits in env vars.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("RUNTIME_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("RUNTIME_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(region) = env::var("AWS_REGION") {
            self.region = region;
        }
        if let Ok(bucket) = env::var("FILE_BUCKET") {
            self.tooling.file_bucket = Some(bucket);
        }
        if let Ok(path) = env::var("MCP_CONFIG") {
            self.tooling.manifest_path = path.into();
        }
        if let Ok(dir) = env::var("WORKSPACE_DIR") {
            self.tooling.workspace_dir = dir.into();
        }
        if let Ok(url) = env::var("GATEWAY_URL") {
            self.gateway.url = Some(url);
        }
        if let Ok(name) = env::var("IDENTITY_PROVIDER_NAME") {
            self.gateway.provider_name = name;
        }
        if let Ok(scope) = env::var("COGNITO_SCOPE") {
            self.gateway.scope = Some(scope);
        }
        if let Ok(url) = env::var("COGNITO_TOKEN_URL") {
            self.gateway.token_url = Some(url);
        }
        if let Ok(id) = env::var("GATEWAY_CLIENT_ID") {
            self.gateway.client_id = Some(id);
        }
        if let Ok(secret) = env::var("GATEWAY_CLIENT_SECRET") {
            self.gateway.client_secret = Some(secret);
        }
        if let Ok(max) = env::var("MAX_ITERATIONS") {
            if let Ok(parsed) = max.parse::<usize>() {
                self.agent.max_iterations = parsed.max(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_self_contained() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.agent.max_iterations, 20);
        assert_eq!(cfg.tooling.manifest_path, PathBuf::from("mcp.json"));
        assert_eq!(cfg.tooling.workspace_dir, PathBuf::from("/tmp/ws"));
        assert_eq!(cfg.gateway.provider_name, "agentcore-identity-for-gateway");
        assert!(cfg.gateway.url.is_none());
    }

    #[test]
    fn loads_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "region = 'eu-west-1'\n[server]\nhost = '127.0.0.1'\nport = 9000\n[agent]\nmax_iterations = 5"
        )
        .unwrap();

        env::set_var("RUNTIME_PORT", "9100");
        env::set_var("FILE_BUCKET", "artifacts");
        let cfg = RuntimeConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("RUNTIME_PORT");
        env::remove_var("FILE_BUCKET");

        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.region, "eu-west-1");
        assert_eq!(cfg.agent.max_iterations, 5);
        assert_eq!(cfg.tooling.file_bucket, Some("artifacts".into()));
    }

    #[test]
    fn rejects_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not toml at all [[[").unwrap();
        assert!(RuntimeConfig::from_file(file.path()).is_err());
    }
}
