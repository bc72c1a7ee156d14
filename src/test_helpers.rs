//! Shared test doubles: an in-memory ledger and a scripted backend.

use crate::backend::{BackendHandle, BackendState, DownloaderBackend, SubmitRequest};
use crate::dispatch::LedgerStore;
use crate::error::{BackendError, DatabaseError, Error, FetchError, Result};
use crate::sources::{FeedSource, SeriesQuery};
use crate::types::{
    AcquisitionDecision, Action, EpisodeIdentity, EpisodeNumber, LedgerKey, LedgerRecord,
    RawFeedItem, SeriesId, SourceKind,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Append-only in-memory ledger
#[derive(Default)]
pub(crate) struct MemoryLedger {
    history: Mutex<Vec<LedgerRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every following `put` fail
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every record written for `key`, oldest first
    pub(crate) fn history(&self, key: &LedgerKey) -> Vec<LedgerRecord> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.key == *key)
            .cloned()
            .collect()
    }

    pub(crate) fn insert(&self, record: LedgerRecord) {
        self.history.lock().unwrap().push(record);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get(&self, key: &LedgerKey) -> Result<Option<LedgerRecord>> {
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.key == *key)
            .cloned())
    }

    async fn put(&self, record: &LedgerRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(DatabaseError::QueryFailed(
                "disk I/O error".to_string(),
            )));
        }
        self.history.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list(&self, series: Option<SeriesId>) -> Result<Vec<LedgerRecord>> {
        let latest: BTreeMap<LedgerKey, LedgerRecord> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|r| series.is_none_or(|s| r.key.series == s))
            .map(|r| (r.key, r.clone()))
            .collect();
        Ok(latest.into_values().collect())
    }
}

/// Backend whose answers are scripted per call
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    submit_results: Mutex<VecDeque<std::result::Result<BackendHandle, BackendError>>>,
    submissions: Mutex<Vec<SubmitRequest>>,
    states: Mutex<HashMap<String, std::result::Result<BackendState, BackendError>>>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `submit`; unscripted calls succeed
    pub(crate) fn push_submit(&self, result: std::result::Result<BackendHandle, BackendError>) {
        self.submit_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn set_state(
        &self,
        handle: &str,
        state: std::result::Result<BackendState, BackendError>,
    ) {
        self.states.lock().unwrap().insert(handle.to_string(), state);
    }

    pub(crate) fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloaderBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn submit(
        &self,
        request: &SubmitRequest,
    ) -> std::result::Result<BackendHandle, BackendError> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(request.clone());
        let n = submissions.len();
        drop(submissions);

        self.submit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(BackendHandle(format!("handle-{n}"))))
    }

    async fn status(
        &self,
        handle: &BackendHandle,
    ) -> std::result::Result<BackendState, BackendError> {
        self.states
            .lock()
            .unwrap()
            .get(handle.as_str())
            .cloned()
            .unwrap_or(Ok(BackendState::Active))
    }
}

pub(crate) fn rejected(reason: &str) -> BackendError {
    BackendError::Submit {
        backend: "scripted",
        reason: reason.to_string(),
        transient: false,
    }
}

pub(crate) fn decision(series: i64, episode: u32, action: Action) -> AcquisitionDecision {
    let item = RawFeedItem {
        series: SeriesId(series),
        title: format!("[A] Example - {episode:02} [1080p]"),
        uri: format!("magnet:?xt=urn:btih:{series}x{episode}"),
        published: Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap(),
        source: SourceKind::Mikan,
    };
    AcquisitionDecision {
        identity: EpisodeIdentity {
            series: SeriesId(series),
            episode: EpisodeNumber::from_whole(episode),
            release_group: Some("A".to_string()),
            resolution: Some("1080p".to_string()),
            source: SourceKind::Mikan,
        },
        action,
        item,
        reason: None,
    }
}

/// Feed source returning a fixed listing
pub(crate) struct StaticSource {
    kind: SourceKind,
    result: Mutex<std::result::Result<Vec<RawFeedItem>, FetchError>>,
    calls: AtomicU32,
}

impl StaticSource {
    pub(crate) fn new(
        kind: SourceKind,
        result: std::result::Result<Vec<RawFeedItem>, FetchError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Mutex::new(result),
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn set(&self, result: std::result::Result<Vec<RawFeedItem>, FetchError>) {
        *self.result.lock().unwrap() = result;
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for StaticSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(
        &self,
        _query: &SeriesQuery,
    ) -> std::result::Result<Vec<RawFeedItem>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().unwrap().clone()
    }
}

/// Feed item published on day `day` of April 2024
pub(crate) fn feed_item(series: i64, title: &str, uri: &str, day: u32) -> RawFeedItem {
    RawFeedItem {
        series: SeriesId(series),
        title: title.to_string(),
        uri: uri.to_string(),
        published: Utc.with_ymd_and_hms(2024, 4, day, 12, 0, 0).unwrap(),
        source: SourceKind::Mikan,
    }
}
