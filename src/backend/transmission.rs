//! Transmission RPC backend.
//!
//! Transmission answers `409 Conflict` with an `X-Transmission-Session-Id`
//! header until the client echoes that header back; the id is cached and
//! the request repeated once.

use super::{BackendHandle, BackendState, DownloaderBackend, RpcFailure, SubmitRequest, http_client};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use url::Url;

const NAME: &str = "transmission";
const SESSION_HEADER: &str = "X-Transmission-Session-Id";

/// Transmission `torrent-get` status codes
const STATUS_DOWNLOAD: i64 = 4;
const STATUS_SEED_WAIT: i64 = 5;
const STATUS_SEED: i64 = 6;
/// `error` value for local errors; 1 and 2 are tracker warnings
const ERROR_LOCAL: i64 = 3;

/// Transmission daemon reached over its RPC endpoint
pub struct TransmissionBackend {
    client: reqwest::Client,
    rpc_url: Url,
    username: Option<String>,
    password: Option<String>,
    session_id: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TorrentStatus {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    error: i64,
    #[serde(default)]
    error_string: String,
}

impl TransmissionBackend {
    /// Create a backend for `rpc_url` with optional basic auth
    pub fn new(
        rpc_url: &str,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, BackendError> {
        let rpc_url = Url::parse(rpc_url).map_err(|e| BackendError::Unavailable {
            backend: NAME,
            reason: format!("invalid RPC URL '{rpc_url}': {e}"),
        })?;
        Ok(Self {
            client: http_client(NAME)?,
            rpc_url,
            username,
            password,
            session_id: RwLock::new(None),
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, RpcFailure> {
        let mut request = self.client.post(self.rpc_url.clone()).json(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }
        if let Some(session_id) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_HEADER, session_id);
        }
        Ok(request.send().await?)
    }

    async fn rpc(&self, method: &str, arguments: Value) -> Result<Value, RpcFailure> {
        let body = json!({ "method": method, "arguments": arguments });

        let mut response = self.send(&body).await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            let session_id = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| RpcFailure::rejected("409 without session id"))?;
            tracing::debug!("Refreshing Transmission session id");
            *self.session_id.write().await = Some(session_id);
            response = self.send(&body).await?;
        }

        if !response.status().is_success() {
            return Err(RpcFailure::http(response.status()));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcFailure::rejected(format!("malformed RPC response: {e}")))?;
        if parsed.result != "success" {
            return Err(RpcFailure::rejected(parsed.result));
        }
        Ok(parsed.arguments)
    }
}

#[async_trait]
impl DownloaderBackend for TransmissionBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, BackendError> {
        let arguments = json!({
            "filename": request.uri,
            "download-dir": request.save_path.to_string_lossy(),
        });
        let reply = self
            .rpc("torrent-add", arguments)
            .await
            .map_err(|e| e.into_submit_error(NAME))?;

        let torrent = reply
            .get("torrent-added")
            .or_else(|| reply.get("torrent-duplicate"))
            .ok_or_else(|| BackendError::Submit {
                backend: NAME,
                reason: "torrent-add reply names no torrent".to_string(),
                transient: false,
            })?;
        let hash = torrent
            .get("hashString")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Submit {
                backend: NAME,
                reason: "torrent-add reply has no hashString".to_string(),
                transient: false,
            })?;

        if reply.get("torrent-duplicate").is_some() {
            tracing::info!(hash = hash, title = %request.title, "Torrent already known to Transmission");
        }
        Ok(BackendHandle(hash.to_string()))
    }

    async fn status(&self, handle: &BackendHandle) -> Result<BackendState, BackendError> {
        let arguments = json!({
            "ids": [handle.as_str()],
            "fields": ["hashString", "status", "percentDone", "error", "errorString"],
        });
        let reply = self
            .rpc("torrent-get", arguments)
            .await
            .map_err(|e| e.into_unavailable(NAME))?;

        let torrents: Vec<TorrentStatus> = reply
            .get("torrents")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| BackendError::Unavailable {
                backend: NAME,
                reason: format!("malformed torrent-get reply: {e}"),
            })?
            .unwrap_or_default();

        let Some(torrent) = torrents.into_iter().next() else {
            tracing::warn!(handle = %handle, "Torrent no longer known to Transmission");
            return Ok(BackendState::Failed);
        };

        Ok(map_status(&torrent))
    }
}

fn map_status(torrent: &TorrentStatus) -> BackendState {
    if torrent.error == ERROR_LOCAL {
        tracing::debug!(error = %torrent.error_string, "Transmission reports torrent error");
        return BackendState::Failed;
    }
    if torrent.percent_done >= 1.0
        || matches!(torrent.status, STATUS_SEED_WAIT | STATUS_SEED)
    {
        return BackendState::Done;
    }
    match torrent.status {
        STATUS_DOWNLOAD => BackendState::Active,
        _ => BackendState::Queued,
    }
}
