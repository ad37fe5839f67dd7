//! HTTP serving surface.
//!
//! `POST /invocations` streams NDJSON run events; `GET /ping` answers the
//! health probe. A fresh session is bound per invocation, keyed by the
//! runtime session header when the caller supplies one.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::runtime::{AgentRuntime, InvocationRequest};

const SESSION_HEADER: &str = "x-amzn-bedrock-agentcore-runtime-session-id";

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .with_state(runtime)
}

async fn ping() -> impl IntoResponse {
    Json(json!({ "status": "Healthy" }))
}

async fn invocations(
    State(runtime): State<Arc<AgentRuntime>>,
    headers: HeaderMap,
    Json(request): Json<InvocationRequest>,
) -> Response {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let trace_id = Uuid::new_v4().to_string();
    info!(session = %session_id, trace = %trace_id, "invocation received");

    let ctx = runtime.bind_session(session_id, trace_id);
    let lines = runtime
        .process_request_streaming(ctx, request)
        .map(Ok::<_, Infallible>);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

pub async fn serve(runtime: Arc<AgentRuntime>, addr: SocketAddr) -> Result<()> {
    let app = router(runtime);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "agent runtime listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
