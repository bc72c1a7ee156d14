//! Common test utilities for bangumi-dl integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bangumi_dl::{
    BackendError, BackendHandle, BackendState, Config, Database, DownloaderBackend, FeedSource,
    FetchError, FilterRules, RawFeedItem, Reconciler, RetryConfig, SeriesConfig, SeriesId,
    SeriesQuery, SourceKind, SourceRegistry, StorageConfig, SubmitRequest,
};
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Backend that records submissions and answers from a script
#[derive(Default)]
pub struct RecordingBackend {
    script: Mutex<VecDeque<Result<BackendHandle, BackendError>>>,
    submissions: Mutex<Vec<SubmitRequest>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject the next `n` submissions
    pub fn reject_next(&self, n: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Err(BackendError::Submit {
                backend: "recording",
                reason: "torrent rejected".to_string(),
                transient: false,
            }));
        }
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submitted_uris(&self) -> Vec<String> {
        self.submissions().into_iter().map(|s| s.uri).collect()
    }
}

#[async_trait]
impl DownloaderBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<BackendHandle, BackendError> {
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(request.clone());
        let n = submissions.len();
        drop(submissions);

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(BackendHandle(format!("t-{n}"))))
    }

    async fn status(&self, _handle: &BackendHandle) -> Result<BackendState, BackendError> {
        Ok(BackendState::Active)
    }
}

/// Source that serves the same listing for every query, tagged with the
/// queried series
pub struct ListingSource {
    kind: SourceKind,
    listing: Mutex<Vec<(String, String, u32)>>,
}

impl ListingSource {
    /// `listing` holds (title, uri, day of April 2024)
    pub fn new(kind: SourceKind, listing: &[(&str, &str, u32)]) -> Arc<Self> {
        Arc::new(Self {
            kind,
            listing: Mutex::new(
                listing
                    .iter()
                    .map(|(t, u, d)| (t.to_string(), u.to_string(), *d))
                    .collect(),
            ),
        })
    }
}

#[async_trait]
impl FeedSource for ListingSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, query: &SeriesQuery) -> Result<Vec<RawFeedItem>, FetchError> {
        Ok(self
            .listing
            .lock()
            .unwrap()
            .iter()
            .map(|(title, uri, day)| item(query.series, title, uri, *day, self.kind))
            .collect())
    }
}

/// Feed item published at noon on `day` of April 2024
pub fn item(series: SeriesId, title: &str, uri: &str, day: u32, source: SourceKind) -> RawFeedItem {
    RawFeedItem {
        series,
        title: title.to_string(),
        uri: uri.to_string(),
        published: Utc.with_ymd_and_hms(2024, 4, day, 12, 0, 0).unwrap(),
        source,
    }
}

/// Configuration with one subscription and no in-call retries
pub fn config(name: &str, filters: FilterRules) -> Config {
    Config {
        subscriptions: vec![SeriesConfig {
            name: name.to_string(),
            keyword: None,
            filters,
            active: true,
        }],
        storage: StorageConfig {
            save_path: PathBuf::from("/downloads"),
            ..StorageConfig::default()
        },
        retry: RetryConfig::disabled(),
        ..Config::default()
    }
}

/// Reconciler over a throwaway database
pub struct TestReconciler {
    pub reconciler: Reconciler,
    pub backend: Arc<RecordingBackend>,
    pub dir: TempDir,
}

pub async fn reconciler(config: Config, sources: Vec<Arc<dyn FeedSource>>) -> TestReconciler {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(&dir.path().join("ledger.db")).await.unwrap();

    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source);
    }
    let backend = RecordingBackend::new();
    let reconciler = Reconciler::with_components(config, Arc::new(db), registry, backend.clone())
        .await
        .unwrap();

    TestReconciler {
        reconciler,
        backend,
        dir,
    }
}
