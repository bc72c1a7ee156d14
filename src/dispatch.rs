//! Dispatch coordinator
//!
//! The only writer of ledger records. For every `fetch`/`retry` decision it
//! records a `pending` intent *before* calling the backend, so a crash
//! between the two leaves a record that a later pass re-submits. The backend
//! result then moves the record to `downloading` or `failed`.
//!
//! ```text
//! (none) ─► pending ─► downloading ─► done
//!              │            │
//!              └──► failed ◄┘
//!                     │
//!                     └─► pending   (retry, while attempts < limit)
//! ```

use crate::backend::{BackendHandle, BackendState, DownloaderBackend, SubmitRequest};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{AcquisitionDecision, Action, Event, LedgerKey, LedgerRecord, LedgerStatus, SeriesId};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event channel capacity when the dispatcher owns its channel
const EVENT_CAPACITY: usize = 1024;

/// Ledger store capability
///
/// `put` must be atomic per key; `get` and `list` return the latest record
/// of each key.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Latest record for `key`
    async fn get(&self, key: &LedgerKey) -> Result<Option<LedgerRecord>>;

    /// Persist `record` as the latest state of its key
    async fn put(&self, record: &LedgerRecord) -> Result<()>;

    /// Latest record of every key, optionally restricted to one series
    async fn list(&self, series: Option<SeriesId>) -> Result<Vec<LedgerRecord>>;
}

/// Result of dispatching one decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The backend accepted the URI
    Submitted {
        /// Backend handle stored on the record
        handle: BackendHandle,
    },
    /// The backend rejected the URI; the record is now `failed`
    SubmitFailed {
        /// Failure description stored on the record
        reason: String,
        /// Submissions used for this key so far
        attempts: u32,
    },
    /// Nothing was sent to the backend
    Skipped(Action),
}

/// Counts from one status sync
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Downloading records queried
    pub checked: usize,
    /// Records moved to `done`
    pub completed: usize,
    /// Records moved to `failed`
    pub failed: usize,
    /// Records whose status could not be queried
    pub unavailable: usize,
}

/// Drives accepted decisions through the backend and owns ledger transitions
pub struct Dispatcher {
    ledger: Arc<dyn LedgerStore>,
    backend: Arc<dyn DownloaderBackend>,
    retry: RetryConfig,
    event_tx: broadcast::Sender<Event>,
}

impl Dispatcher {
    /// Create a dispatcher with its own event channel
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        backend: Arc<dyn DownloaderBackend>,
        retry: RetryConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ledger,
            backend,
            retry,
            event_tx,
        }
    }

    /// Publish events on an existing channel
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = event_tx;
        self
    }

    /// Subscribe to dispatch events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Name of the active backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Dispatch one decision
    ///
    /// Skip decisions return immediately. For `fetch`/`retry` the pending
    /// write happens before the backend call; a backend failure is not an
    /// error of this function but a `failed` record.
    ///
    /// # Errors
    ///
    /// [`Error::LedgerWrite`] when a ledger write fails. The caller must stop
    /// dispatching for this series.
    #[tracing::instrument(
        skip_all,
        fields(series = %decision.identity.series, episode = %decision.identity.episode, action = %decision.action)
    )]
    pub async fn dispatch(
        &self,
        decision: &AcquisitionDecision,
        save_path: &Path,
    ) -> Result<DispatchOutcome> {
        if !decision.action.is_dispatch() {
            return Ok(DispatchOutcome::Skipped(decision.action));
        }

        let key = decision.identity.key();
        let previous = self.ledger.get(&key).await?;
        if let Some(previous) = &previous {
            if matches!(previous.status, LedgerStatus::Downloading | LedgerStatus::Done) {
                tracing::debug!(status = %previous.status, "Record already active, not resubmitting");
                return Ok(DispatchOutcome::Skipped(Action::SkipDuplicate));
            }
        }

        let attempts = previous.as_ref().map_or(0, |p| p.attempts) + 1;
        let pending = LedgerRecord::pending(decision, attempts, Utc::now());
        self.write(&pending).await?;

        let request = SubmitRequest {
            uri: decision.item.uri.clone(),
            save_path: save_path.to_path_buf(),
            title: decision.item.title.clone(),
        };

        match with_retry(&self.retry, || self.backend.submit(&request)).await {
            Ok(handle) => {
                let mut record = pending.with_status(LedgerStatus::Downloading, Utc::now());
                record.handle = Some(handle.as_str().to_string());
                self.write(&record).await?;

                tracing::info!(
                    backend = self.backend.name(),
                    handle = %handle,
                    attempts,
                    title = %decision.item.title,
                    "Episode submitted"
                );
                let _ = self.event_tx.send(Event::Dispatched {
                    key,
                    handle: handle.as_str().to_string(),
                });
                Ok(DispatchOutcome::Submitted { handle })
            }
            Err(e) => {
                let reason = e.to_string();
                let mut record = pending.with_status(LedgerStatus::Failed, Utc::now());
                record.last_error = Some(reason.clone());
                self.write(&record).await?;

                tracing::warn!(
                    backend = self.backend.name(),
                    attempts,
                    error = %reason,
                    title = %decision.item.title,
                    "Submission failed"
                );
                let _ = self.event_tx.send(Event::SubmitFailed {
                    key,
                    attempts,
                    error: reason.clone(),
                });
                Ok(DispatchOutcome::SubmitFailed { reason, attempts })
            }
        }
    }

    /// Apply a backend state observed for `key`
    ///
    /// `done` is terminal: a done record is never changed. A terminal
    /// backend success moves any other record to `done`, a terminal failure
    /// moves it to `failed`. Returns the new record when it changed.
    pub async fn apply_backend_state(
        &self,
        key: &LedgerKey,
        state: BackendState,
    ) -> Result<Option<LedgerRecord>> {
        let Some(record) = self.ledger.get(key).await? else {
            tracing::debug!(key = %key, "No ledger record for observed backend state");
            return Ok(None);
        };

        let updated = match (record.status, state) {
            (LedgerStatus::Done, _) => None,
            (_, BackendState::Done) => Some(record.with_status(LedgerStatus::Done, Utc::now())),
            (LedgerStatus::Failed, BackendState::Failed) => None,
            (_, BackendState::Failed) => {
                let mut failed = record.with_status(LedgerStatus::Failed, Utc::now());
                failed.last_error = Some(format!("{} reported the download as failed", self.backend.name()));
                Some(failed)
            }
            (_, BackendState::Queued | BackendState::Active) => None,
        };

        if let Some(updated) = &updated {
            self.write(updated).await?;
            tracing::info!(key = %key, from = %record.status, to = %updated.status, "Ledger record updated from backend");
            if updated.status == LedgerStatus::Done {
                let _ = self.event_tx.send(Event::Completed { key: *key });
            }
        }
        Ok(updated)
    }

    /// Poll the backend for every `downloading` record of `series`
    ///
    /// A backend that cannot be reached leaves the records untouched.
    pub async fn sync_backend_status(&self, series: SeriesId) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let records = self.ledger.list(Some(series)).await?;
        for record in records {
            if record.status != LedgerStatus::Downloading {
                continue;
            }
            let Some(handle) = record.handle.as_deref() else {
                continue;
            };
            report.checked += 1;

            let state = match self.backend.status(&BackendHandle(handle.to_string())).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(key = %record.key, error = %e, "Could not query download status");
                    report.unavailable += 1;
                    continue;
                }
            };

            if let Some(updated) = self.apply_backend_state(&record.key, state).await? {
                match updated.status {
                    LedgerStatus::Done => report.completed += 1,
                    LedgerStatus::Failed => report.failed += 1,
                    LedgerStatus::Pending | LedgerStatus::Downloading => {}
                }
            }
        }

        Ok(report)
    }

    async fn write(&self, record: &LedgerRecord) -> Result<()> {
        self.ledger
            .put(record)
            .await
            .map_err(|e| Error::LedgerWrite {
                key: record.key,
                reason: e.to_string(),
            })
    }
}
