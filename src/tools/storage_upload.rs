//! Workspace file upload built-in.
//!
//! Uploads a file from the workspace directory to the configured bucket and
//! replies with its public URL, keyed by the session's trace id. With no
//! bucket configured the tool stays registered but degrades to a local-path
//! reply so the agent can still reference the artifact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::{Result, RuntimeError};
use crate::tool::Tool;
use crate::tools::validate_workspace_path;

pub struct StorageUploadTool {
    bucket: Option<String>,
    region: String,
    workspace_dir: PathBuf,
    trace_id: String,
}

impl StorageUploadTool {
    pub fn new(
        bucket: Option<String>,
        region: impl Into<String>,
        workspace_dir: PathBuf,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            bucket,
            region: region.into(),
            workspace_dir,
            trace_id: trace_id.into(),
        }
    }

    fn object_key(&self, filename: &str) -> String {
        format!("agentcore/{}/{}", self.trace_id, filename)
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("https://{bucket}.s3.{}.amazonaws.com/{key}", self.region)
    }
}

#[async_trait]
impl Tool for StorageUploadTool {
    fn name(&self) -> &str {
        "upload_file_to_s3"
    }

    fn description(&self) -> &str {
        "Upload a file from the workspace directory to S3 and return its public URL. \
         The file must already exist under the workspace directory."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "filepath": {
                    "type": "string",
                    "description": "Absolute path of the file to upload; must be under the workspace directory"
                }
            },
            "required": ["filepath"]
        }))
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let filepath = input
            .get("filepath")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidInput("missing `filepath`".into()))?;
        let path = Path::new(filepath);

        validate_workspace_path(path, &self.workspace_dir)?;

        let Some(bucket) = self.bucket.clone() else {
            warn!("no upload bucket configured; returning local path");
            return Ok(json!(format!(
                "Upload skipped (no bucket configured). Local file path: {filepath}"
            )));
        };

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                RuntimeError::InvalidInput(format!("{filepath} has no usable file name"))
            })?;
        let key = self.object_key(filename);

        let body = ByteStream::from_path(path).await.map_err(|err| {
            RuntimeError::ToolInvocation {
                name: self.name().into(),
                source: Box::new(err),
            }
        })?;

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&config);

        match client
            .put_object()
            .bucket(&bucket)
            .key(&key)
            .body(body)
            .send()
            .await
        {
            Ok(_) => Ok(json!(self.public_url(&bucket, &key))),
            Err(err) => {
                error!(%bucket, %key, error = %err, "upload failed");
                Ok(json!(format!(
                    "Error uploading file: {err}. Local file path: {filepath}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(bucket: Option<&str>) -> StorageUploadTool {
        StorageUploadTool::new(
            bucket.map(String::from),
            "us-east-1",
            PathBuf::from("/tmp/ws"),
            "trace-42",
        )
    }

    #[test]
    fn url_encodes_bucket_trace_and_filename() {
        let tool = tool(Some("artifacts"));
        let key = tool.object_key("report.csv");
        assert_eq!(key, "agentcore/trace-42/report.csv");
        assert_eq!(
            tool.public_url("artifacts", &key),
            "https://artifacts.s3.us-east-1.amazonaws.com/agentcore/trace-42/report.csv"
        );
    }

    #[tokio::test]
    async fn rejects_paths_outside_workspace_before_any_upload() {
        let tool = tool(Some("artifacts"));
        let result = tool.call(json!({"filepath": "/etc/passwd"})).await;
        assert!(matches!(result, Err(RuntimeError::InvalidInput(_))));

        let result = tool
            .call(json!({"filepath": "/tmp/ws/../etc/passwd"}))
            .await;
        assert!(matches!(result, Err(RuntimeError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn missing_bucket_degrades_to_local_path() {
        let tool = tool(None);
        let reply = tool
            .call(json!({"filepath": "/tmp/ws/report.csv"}))
            .await
            .unwrap();
        let text = reply.as_str().unwrap();
        assert!(text.contains("/tmp/ws/report.csv"));
        assert!(text.contains("skipped"));
    }

    #[tokio::test]
    async fn missing_filepath_is_invalid_input() {
        let tool = tool(Some("artifacts"));
        assert!(matches!(
            tool.call(json!({})).await,
            Err(RuntimeError::InvalidInput(_))
        ));
    }
}
