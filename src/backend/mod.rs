//! Downloader backends
//!
//! A backend accepts a magnet/torrent URI and later reports the state of the
//! resulting download. The set of backends is closed and selected once at
//! startup from [`BackendConfig`]:
//! - [`TransmissionBackend`] for Transmission RPC
//! - [`Aria2Backend`] for aria2 JSON-RPC

use crate::config::BackendConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod aria2;
mod transmission;

pub use aria2::Aria2Backend;
pub use transmission::TransmissionBackend;

/// Timeout applied to every RPC request
pub(crate) const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// One submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Magnet or torrent URI
    pub uri: String,
    /// Download directory on the backend host
    pub save_path: PathBuf,
    /// Release title, for logging
    pub title: String,
}

/// Opaque backend-specific identifier of an accepted download
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(pub String);

impl BackendHandle {
    /// Borrow the raw handle
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Download state as reported by a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Accepted, waiting to start
    Queued,
    /// Transferring
    Active,
    /// Finished successfully (terminal)
    Done,
    /// Finished with an error or removed (terminal)
    Failed,
}

impl BackendState {
    /// Whether the ledger must be updated for this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendState::Done | BackendState::Failed)
    }
}

/// Downloader capability
///
/// Implementations must be safe to share across series passes.
#[async_trait]
pub trait DownloaderBackend: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &'static str;

    /// Hand a URI to the backend
    ///
    /// # Errors
    ///
    /// [`BackendError::Submit`] when the backend rejects the request,
    /// [`BackendError::Unavailable`] when it cannot be reached.
    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, BackendError>;

    /// Query the state of a previously accepted download
    ///
    /// # Errors
    ///
    /// [`BackendError::Unavailable`] when the backend cannot be reached.
    async fn status(&self, handle: &BackendHandle) -> Result<BackendState, BackendError>;
}

/// Build the backend selected by configuration
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn DownloaderBackend>, BackendError> {
    match config {
        BackendConfig::Transmission {
            rpc_url,
            username,
            password,
        } => {
            let backend = TransmissionBackend::new(rpc_url, username.clone(), password.clone())?;
            tracing::info!(backend = backend.name(), url = %rpc_url, "Using downloader backend");
            Ok(Arc::new(backend))
        }
        BackendConfig::Aria2 { rpc_url, secret } => {
            let backend = Aria2Backend::new(rpc_url, secret.clone())?;
            tracing::info!(backend = backend.name(), url = %rpc_url, "Using downloader backend");
            Ok(Arc::new(backend))
        }
    }
}

/// RPC failure before it is classified as a submit or status error
#[derive(Debug)]
pub(crate) struct RpcFailure {
    pub(crate) reason: String,
    pub(crate) transient: bool,
    /// The request never reached the backend
    pub(crate) unreachable: bool,
}

impl RpcFailure {
    pub(crate) fn unreachable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: true,
            unreachable: true,
        }
    }

    pub(crate) fn http(status: reqwest::StatusCode) -> Self {
        Self {
            reason: format!("HTTP {status}"),
            transient: status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS,
            unreachable: false,
        }
    }

    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: false,
            unreachable: false,
        }
    }

    pub(crate) fn into_submit_error(self, backend: &'static str) -> BackendError {
        if self.unreachable {
            BackendError::Unavailable {
                backend,
                reason: self.reason,
            }
        } else {
            BackendError::Submit {
                backend,
                reason: self.reason,
                transient: self.transient,
            }
        }
    }

    pub(crate) fn into_unavailable(self, backend: &'static str) -> BackendError {
        BackendError::Unavailable {
            backend,
            reason: self.reason,
        }
    }
}

impl From<reqwest::Error> for RpcFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            RpcFailure::unreachable(e.to_string())
        } else {
            RpcFailure {
                reason: e.to_string(),
                transient: false,
                unreachable: false,
            }
        }
    }
}

pub(crate) fn http_client(backend: &'static str) -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .timeout(RPC_TIMEOUT)
        .build()
        .map_err(|e| BackendError::Unavailable {
            backend,
            reason: format!("failed to build HTTP client: {e}"),
        })
}
