use super::*;
use crate::backend::BackendState;
use crate::config::{SeriesConfig, StorageConfig};
use crate::error::FetchError;
use crate::test_helpers::{ScriptedBackend, StaticSource, decision, feed_item, rejected};
use crate::types::{Action, EpisodeNumber, FilterRules, LedgerKey, LedgerRecord, LedgerStatus, SeriesId, SourceKind};
use std::path::PathBuf;
use tempfile::NamedTempFile;

struct Harness {
    reconciler: Reconciler,
    backend: Arc<ScriptedBackend>,
    source: Arc<StaticSource>,
    _temp: NamedTempFile,
}

fn config() -> Config {
    Config {
        subscriptions: vec![SeriesConfig {
            name: "Frieren".to_string(),
            keyword: None,
            filters: FilterRules::default(),
            active: true,
        }],
        storage: StorageConfig {
            save_path: PathBuf::from("/srv/bangumi"),
            ..StorageConfig::default()
        },
        retry: crate::config::RetryConfig::disabled(),
        ..Config::default()
    }
}

fn frieren_items() -> Vec<crate::types::RawFeedItem> {
    vec![
        feed_item(1, "[A] Frieren - 01 [1080p]", "magnet:?xt=urn:btih:one", 1),
        feed_item(1, "[A] Frieren - 02 [1080p]", "magnet:?xt=urn:btih:two", 8),
    ]
}

async fn harness_with(db: Arc<Database>, temp: NamedTempFile) -> Harness {
    let backend = Arc::new(ScriptedBackend::new());
    let source = StaticSource::new(SourceKind::Mikan, Ok(frieren_items()));
    let mut sources = SourceRegistry::new();
    sources.register(source.clone());

    let reconciler = Reconciler::with_components(config(), db, sources, backend.clone())
        .await
        .unwrap();
    Harness {
        reconciler,
        backend,
        source,
        _temp: temp,
    }
}

async fn harness() -> Harness {
    let temp = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp.path()).await.unwrap());
    harness_with(db, temp).await
}

fn key(episode: u32) -> LedgerKey {
    LedgerKey::new(SeriesId(1), EpisodeNumber::from_whole(episode))
}

#[tokio::test]
async fn new_episodes_are_dispatched_once() {
    let h = harness().await;
    let cancel = CancellationToken::new();

    let first = h.reconciler.run_pass(&cancel).await.unwrap();
    let outcome = first.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.fetched, 2);
    assert_eq!(outcome.dispatched, 2);
    assert!(outcome.aborted.is_none());

    let submissions = h.backend.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[0].uri, "magnet:?xt=urn:btih:one");
    assert_eq!(submissions[0].save_path, PathBuf::from("/srv/bangumi/Frieren"));

    let second = h.reconciler.run_pass(&cancel).await.unwrap();
    let outcome = second.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.dispatched, 0);
    assert_eq!(outcome.skipped_duplicate, 2);
    assert_eq!(h.backend.submissions().len(), 2);
}

#[tokio::test]
async fn rejected_submission_is_retried_next_pass() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    h.backend.push_submit(Err(rejected("tracker offline")));

    let first = h.reconciler.run_pass(&cancel).await.unwrap();
    let outcome = first.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.submit_failed, 1);
    assert_eq!(outcome.dispatched, 1);

    let second = h.reconciler.run_pass(&cancel).await.unwrap();
    assert_eq!(second.outcome(SeriesId(1)).unwrap().dispatched, 1);

    let record = h.reconciler.database().get_latest(&key(1)).await.unwrap().unwrap();
    assert_eq!(record.status, LedgerStatus::Downloading);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn completed_downloads_are_synced_into_the_ledger() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    h.reconciler.run_pass(&cancel).await.unwrap();

    h.backend.set_state("handle-1", Ok(BackendState::Done));
    h.reconciler.run_pass(&cancel).await.unwrap();

    let db = h.reconciler.database();
    assert_eq!(db.get_latest(&key(1)).await.unwrap().unwrap().status, LedgerStatus::Done);
    assert_eq!(
        db.get_latest(&key(2)).await.unwrap().unwrap().status,
        LedgerStatus::Downloading
    );
}

#[tokio::test]
async fn failing_source_is_reported_and_others_still_count() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    h.source
        .set(Err(FetchError::permanent(SourceKind::Mikan, "HTTP 404")));

    let report = h.reconciler.run_pass(&cancel).await.unwrap();
    let outcome = report.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.fetched, 0);
    assert_eq!(outcome.fetch_errors.len(), 1);
    assert!(outcome.fetch_errors[0].contains("HTTP 404"));
    assert!(outcome.aborted.is_none());
}

#[tokio::test]
async fn cancelled_pass_dispatches_nothing() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.reconciler.run_pass(&cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(
        report.outcome(SeriesId(1)).unwrap().aborted.as_deref(),
        Some("cancelled")
    );
    assert!(h.backend.submissions().is_empty());
    assert_eq!(h.source.calls(), 0);
}

#[tokio::test]
async fn lost_pending_record_is_recovered_after_unclean_shutdown() {
    let temp = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp.path()).await.unwrap());
    // Previous session started and never shut down
    db.set_clean_start().await.unwrap();

    let h = harness_with(db, temp).await;
    let mut lost = LedgerRecord::pending(&decision(1, 1, Action::Fetch), 1, Utc::now());
    lost.uri = "magnet:?xt=urn:btih:one".to_string();
    h.reconciler.database().put_record(&lost).await.unwrap();

    let report = h.reconciler.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome(SeriesId(1)).unwrap().dispatched, 2);

    let record = h.reconciler.database().get_latest(&key(1)).await.unwrap().unwrap();
    assert_eq!(record.status, LedgerStatus::Downloading);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn fresh_pending_record_blocks_after_clean_shutdown() {
    let h = harness().await;
    let pending = LedgerRecord::pending(&decision(1, 1, Action::Fetch), 1, Utc::now());
    h.reconciler.database().put_record(&pending).await.unwrap();

    let report = h.reconciler.run_pass(&CancellationToken::new()).await.unwrap();
    let outcome = report.outcome(SeriesId(1)).unwrap();
    assert_eq!(outcome.dispatched, 1);
    assert_eq!(outcome.skipped_duplicate, 1);
}

#[tokio::test]
async fn shutdown_rejects_passes_and_records_clean_exit() {
    let h = harness().await;

    h.reconciler.shutdown().await.unwrap();

    let result = h.reconciler.run_pass(&CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::ShuttingDown)));
    assert!(!h.reconciler.database().was_unclean_shutdown().await.unwrap());
}

#[tokio::test]
async fn pass_emits_events_in_order() {
    let h = harness().await;
    let mut events = h.reconciler.subscribe_events();

    h.reconciler.run_pass(&CancellationToken::new()).await.unwrap();

    let received: Vec<Event> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(matches!(received.first(), Some(Event::PassStarted { series_count: 1 })));
    assert!(matches!(received.last(), Some(Event::PassFinished { cancelled: false })));
    let dispatched = received
        .iter()
        .filter(|e| matches!(e, Event::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 2);
    assert!(
        received
            .iter()
            .any(|e| matches!(e, Event::SeriesFinished { outcome } if outcome.dispatched == 2))
    );
}

#[tokio::test]
async fn periodic_runner_stops_on_cancel() {
    let h = harness().await;
    let reconciler = Arc::new(h.reconciler);
    let mut events = reconciler.subscribe_events();
    let cancel = CancellationToken::new();

    let runner = {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            reconciler
                .run_periodic(Duration::from_secs(3600), cancel)
                .await
        })
    };

    loop {
        if let Event::PassFinished { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("runner did not stop")
        .unwrap();
    assert_eq!(h.backend.submissions().len(), 2);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let temp = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp.path()).await.unwrap());
    let mut config = config();
    config.reconcile.fetch_concurrency = 0;

    let result = Reconciler::with_components(
        config,
        db,
        SourceRegistry::new(),
        Arc::new(ScriptedBackend::new()),
    )
    .await;
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn ledger_failure_aborts_only_the_affected_series() {
    let temp = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp.path()).await.unwrap());
    sqlx::query(
        "CREATE TRIGGER reject_frieren BEFORE INSERT ON ledger_records
         WHEN NEW.series_id = 1
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let mut cfg = config();
    cfg.subscriptions.push(SeriesConfig {
        name: "Dandadan".to_string(),
        keyword: None,
        filters: FilterRules::default(),
        active: true,
    });
    let mut items = frieren_items();
    items.push(feed_item(2, "[A] Dandadan - 01 [1080p]", "magnet:?xt=urn:btih:dan1", 2));

    let backend = Arc::new(ScriptedBackend::new());
    let mut sources = SourceRegistry::new();
    sources.register(StaticSource::new(SourceKind::Mikan, Ok(items)));
    let reconciler = Reconciler::with_components(cfg, db, sources, backend.clone())
        .await
        .unwrap();

    let report = reconciler.run_pass(&CancellationToken::new()).await.unwrap();

    let frieren = report.outcome(SeriesId(1)).unwrap();
    assert_eq!(frieren.dispatched, 0);
    let aborted = frieren.aborted.as_deref().unwrap();
    assert!(aborted.contains("ledger write failed"), "{aborted}");
    assert!(aborted.contains("disk full"), "{aborted}");

    let dandadan = report.outcome(SeriesId(2)).unwrap();
    assert!(dandadan.aborted.is_none());
    assert_eq!(dandadan.dispatched, 1);

    let uris: Vec<String> = backend.submissions().into_iter().map(|s| s.uri).collect();
    assert_eq!(uris, vec!["magnet:?xt=urn:btih:dan1"]);

    let db = reconciler.database();
    assert!(db.get_latest(&key(1)).await.unwrap().is_none());
    let dan = LedgerKey::new(SeriesId(2), EpisodeNumber::from_whole(1));
    assert_eq!(
        db.get_latest(&dan).await.unwrap().unwrap().status,
        LedgerStatus::Downloading
    );
}
