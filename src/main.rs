use std::net::SocketAddr;
use std::sync::Arc;

use agentcore_runtime::{init_tracing, server, AgentRuntime, Result, RuntimeConfig, RuntimeError};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match std::env::var("RUNTIME_CONFIG") {
        Ok(path) => RuntimeConfig::from_env_or_file(path)?,
        Err(_) => RuntimeConfig::from_env(),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|err| RuntimeError::Config(format!("invalid listen address: {err}")))?;

    let runtime = Arc::new(AgentRuntime::new(config));
    server::serve(runtime, addr).await
}
