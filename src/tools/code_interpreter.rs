//! Optional sandboxed code-execution built-in.
//!
//! Runs Python source in a subprocess confined to the workspace directory
//! with a bounded timeout and truncated output. Only registered when enabled
//! in config and an interpreter is actually on PATH.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::{Result, RuntimeError};
use crate::tool::Tool;

const INTERPRETER: &str = "python3";

#[derive(Debug, Clone)]
pub struct CodeInterpreterConfig {
    pub workspace_dir: PathBuf,
    pub timeout_secs: u64,
    pub max_output_lines: usize,
}

impl CodeInterpreterConfig {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self {
            workspace_dir,
            timeout_secs: 30,
            max_output_lines: 200,
        }
    }
}

/// Whether the interpreter binary can be found on PATH.
pub fn interpreter_available() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(INTERPRETER).is_file()))
        .unwrap_or(false)
}

pub struct CodeInterpreterTool {
    config: CodeInterpreterConfig,
}

impl CodeInterpreterTool {
    pub fn new(config: CodeInterpreterConfig) -> Self {
        Self { config }
    }
}

fn truncate_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() > max_lines {
        lines[lines.len() - max_lines..].join("\n")
    } else {
        output.to_string()
    }
}

#[async_trait]
impl Tool for CodeInterpreterTool {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn description(&self) -> &str {
        "Execute Python source in a sandboxed interpreter rooted at the workspace \
         directory. Files written under the workspace persist for later tool calls."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "Python source to execute" }
            },
            "required": ["code"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let code = input
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidInput("missing `code`".into()))?;

        let mut cmd = Command::new(INTERPRETER);
        cmd.arg("-c")
            .arg(code)
            .current_dir(&self.config.workspace_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            cmd.output(),
        )
        .await
        .map_err(|_| RuntimeError::ToolInvocation {
            name: "execute_code".into(),
            source: "execution timed out".into(),
        })?
        .map_err(|err| RuntimeError::ToolInvocation {
            name: "execute_code".into(),
            source: Box::new(err),
        })?;

        let stdout = truncate_tail(
            &String::from_utf8_lossy(&output.stdout),
            self.config.max_output_lines,
        );
        let stderr = truncate_tail(
            &String::from_utf8_lossy(&output.stderr),
            self.config.max_output_lines,
        );

        if output.status.success() {
            Ok(json!({
                "stdout": stdout,
                "exit_code": output.status.code().unwrap_or(0)
            }))
        } else {
            Ok(json!({
                "stdout": stdout,
                "error": stderr,
                "exit_code": output.status.code().unwrap_or(-1)
            }))
        }
    }
}
