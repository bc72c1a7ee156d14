//! aria2 JSON-RPC backend.

use super::{BackendHandle, BackendState, DownloaderBackend, RpcFailure, SubmitRequest, http_client};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

const NAME: &str = "aria2";
const REQUEST_ID: &str = "bangumi-dl";

/// aria2 daemon reached over `--enable-rpc`
pub struct Aria2Backend {
    client: reqwest::Client,
    rpc_url: Url,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStatus {
    status: String,
    #[serde(default)]
    followed_by: Vec<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl Aria2Backend {
    /// Create a backend for `rpc_url`, authenticating with `--rpc-secret`
    pub fn new(rpc_url: &str, secret: Option<String>) -> Result<Self, BackendError> {
        let rpc_url = Url::parse(rpc_url).map_err(|e| BackendError::Unavailable {
            backend: NAME,
            reason: format!("invalid RPC URL '{rpc_url}': {e}"),
        })?;
        Ok(Self {
            client: http_client(NAME)?,
            rpc_url,
            secret,
        })
    }

    /// Prepend the `token:` parameter when a secret is configured
    fn params(&self, mut params: Vec<Value>) -> Vec<Value> {
        if let Some(secret) = &self.secret {
            params.insert(0, Value::String(format!("token:{secret}")));
        }
        params
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcFailure> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": REQUEST_ID,
            "method": method,
            "params": self.params(params),
        });

        let response = self
            .client
            .post(self.rpc_url.clone())
            .json(&body)
            .send()
            .await?;

        // aria2 reports RPC errors with 400 and a JSON body
        let status = response.status();
        let reply: RpcReply = match response.json().await {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => return Err(RpcFailure::http(status)),
            Err(e) => {
                return Err(RpcFailure::rejected(format!("malformed RPC response: {e}")));
            }
        };

        if let Some(error) = reply.error {
            return Err(RpcFailure::rejected(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        if !status.is_success() {
            return Err(RpcFailure::http(status));
        }
        reply
            .result
            .ok_or_else(|| RpcFailure::rejected("reply has neither result nor error"))
    }

    async fn tell_status(&self, gid: &str) -> Result<DownloadStatus, RpcFailure> {
        let result = self
            .call(
                "aria2.tellStatus",
                vec![json!(gid), json!(["gid", "status", "followedBy", "errorMessage"])],
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| RpcFailure::rejected(format!("malformed tellStatus reply: {e}")))
    }
}

#[async_trait]
impl DownloaderBackend for Aria2Backend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, BackendError> {
        let options = json!({ "dir": request.save_path.to_string_lossy() });
        let result = self
            .call("aria2.addUri", vec![json!([request.uri]), options])
            .await
            .map_err(|e| e.into_submit_error(NAME))?;

        let gid = result.as_str().ok_or_else(|| BackendError::Submit {
            backend: NAME,
            reason: "addUri did not return a GID".to_string(),
            transient: false,
        })?;
        Ok(BackendHandle(gid.to_string()))
    }

    async fn status(&self, handle: &BackendHandle) -> Result<BackendState, BackendError> {
        let mut download = match self.tell_status(handle.as_str()).await {
            Ok(download) => download,
            Err(e) if e.unreachable || e.transient => return Err(e.into_unavailable(NAME)),
            Err(e) => {
                // aria2 forgets a GID once its result is purged
                tracing::warn!(handle = %handle, error = %e.reason, "aria2 no longer knows the download");
                return Ok(BackendState::Failed);
            }
        };

        // A magnet completes once its metadata is fetched; the payload
        // continues under the GID it is followed by
        if download.status == "complete" {
            if let Some(next) = download.followed_by.first().cloned() {
                download = self
                    .tell_status(&next)
                    .await
                    .map_err(|e| e.into_unavailable(NAME))?;
            }
        }

        Ok(match download.status.as_str() {
            "active" => BackendState::Active,
            "waiting" | "paused" => BackendState::Queued,
            "complete" => BackendState::Done,
            _ => {
                tracing::debug!(
                    handle = %handle,
                    status = %download.status,
                    error = download.error_message.as_deref().unwrap_or_default(),
                    "aria2 download failed"
                );
                BackendState::Failed
            }
        })
    }
}
