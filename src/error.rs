use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{name}` invocation failed: {source}")]
    ToolInvocation {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("event loop reached the maximum iteration count ({limit}); please contact an administrator")]
    IterationLimit { limit: usize },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether this is the distinguished forced-abort condition, as opposed
    /// to a transport, auth, or model failure.
    pub fn is_iteration_limit(&self) -> bool {
        matches!(self, RuntimeError::IterationLimit { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_limit_is_distinguishable() {
        let err = RuntimeError::IterationLimit { limit: 20 };
        assert!(err.is_iteration_limit());
        assert!(err.to_string().contains("20"));

        let other = RuntimeError::Gateway("token exchange failed".into());
        assert!(!other.is_iteration_limit());
    }
}
