//! Reconciliation passes
//!
//! A pass walks every active series: poll the backend for downloads that
//! finished, fetch all sources, reconcile against a ledger snapshot and
//! dispatch the resulting decisions. Series run concurrently up to
//! `reconcile.fetch_concurrency`; inside one series everything is
//! sequential, which is what keeps a ledger key from being dispatched twice
//! at the same time.

use crate::backend::{DownloaderBackend, build_backend};
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::{DispatchOutcome, Dispatcher, LedgerStore};
use crate::error::{Error, Result};
use crate::reconcile::{LedgerSnapshot, ReconcilePolicy, reconcile_detailed};
use crate::sources::{SeriesQuery, SourceRegistry};
use crate::types::{Event, PassReport, Series, SeriesOutcome};
use crate::utils::save_path_for;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event channel capacity
const EVENT_CAPACITY: usize = 1024;

const CANCELLED: &str = "cancelled";

/// Runs reconciliation passes over all subscribed series
pub struct Reconciler {
    db: Arc<Database>,
    config: Config,
    sources: SourceRegistry,
    dispatcher: Dispatcher,
    event_tx: broadcast::Sender<Event>,
    /// Set until the first pass after an unclean shutdown completes
    unclean_start: AtomicBool,
    accepting_passes: AtomicBool,
}

impl Reconciler {
    /// Build a reconciler from configuration
    ///
    /// Opens the database, stores the configured subscriptions and connects
    /// the configured sources and backend.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.persistence.database_path).await?;
        let sources = SourceRegistry::from_config(&config.sources)?;
        let backend = build_backend(&config.backend)?;

        Self::with_components(config, Arc::new(db), sources, backend).await
    }

    /// Build a reconciler around existing components
    pub async fn with_components(
        config: Config,
        db: Arc<Database>,
        sources: SourceRegistry,
        backend: Arc<dyn DownloaderBackend>,
    ) -> Result<Self> {
        config.validate()?;
        for subscription in &config.subscriptions {
            db.subscribe(subscription).await?;
        }

        let unclean = db.was_unclean_shutdown().await?;
        if unclean {
            warn!("Previous session did not shut down cleanly, pending records will be re-dispatched");
        }
        db.set_clean_start().await?;

        if sources.is_empty() {
            warn!("No feed sources enabled, passes will not find any episodes");
        }

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let ledger: Arc<dyn LedgerStore> = db.clone();
        let dispatcher =
            Dispatcher::new(ledger, backend, config.retry.clone()).with_events(event_tx.clone());

        info!(
            backend = dispatcher.backend_name(),
            sources = ?sources.kinds(),
            subscriptions = config.subscriptions.len(),
            "Reconciler ready"
        );

        Ok(Self {
            db,
            config,
            sources,
            dispatcher,
            event_tx,
            unclean_start: AtomicBool::new(unclean),
            accepting_passes: AtomicBool::new(true),
        })
    }

    /// Subscribe to pass and dispatch events
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Database handle (subscriptions, ledger)
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Dispatch coordinator
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run one pass over every active series
    ///
    /// Failures of one series are reported in its outcome and never affect
    /// another series. Cancelling `cancel` stops fetching and dispatching;
    /// ledger records already written stay valid.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown), or a
    /// database error when the subscriptions cannot be read.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassReport> {
        if !self.accepting_passes.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let series = self.db.list_active_series().await?;
        let unclean = self.unclean_start.load(Ordering::SeqCst);
        let policy = ReconcilePolicy::from_config(&self.config.reconcile, Utc::now(), unclean);

        info!(series = series.len(), unclean_recovery = unclean, "Reconciliation pass started");
        let _ = self.event_tx.send(Event::PassStarted {
            series_count: series.len(),
        });

        let concurrency = self.config.reconcile.fetch_concurrency.max(1);
        let mut outcomes: Vec<SeriesOutcome> = futures::stream::iter(series)
            .map(|s| self.run_series(s, &policy, cancel))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|o| o.series);

        let cancelled = cancel.is_cancelled();
        if !cancelled {
            self.unclean_start.store(false, Ordering::SeqCst);
        }

        let report = PassReport {
            series: outcomes,
            cancelled,
        };
        info!(
            series = report.series.len(),
            dispatched = report.dispatched(),
            cancelled,
            "Reconciliation pass finished"
        );
        let _ = self.event_tx.send(Event::PassFinished { cancelled });

        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(series = %series.id, name = %series.name))]
    async fn run_series(
        &self,
        series: Series,
        policy: &ReconcilePolicy,
        cancel: &CancellationToken,
    ) -> SeriesOutcome {
        let mut outcome = SeriesOutcome::new(&series);
        if cancel.is_cancelled() {
            outcome.aborted = Some(CANCELLED.to_string());
            return outcome;
        }

        if let Err(e) = self.process_series(&series, policy, cancel, &mut outcome).await {
            error!(error = %e, "Series pass aborted");
            outcome.aborted = Some(e.to_string());
        }

        info!(
            fetched = outcome.fetched,
            unparsed = outcome.unparsed,
            dispatched = outcome.dispatched,
            submit_failed = outcome.submit_failed,
            skipped_duplicate = outcome.skipped_duplicate,
            skipped_filtered = outcome.skipped_filtered,
            skipped_exhausted = outcome.skipped_exhausted,
            "Series reconciled"
        );
        let _ = self.event_tx.send(Event::SeriesFinished {
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn process_series(
        &self,
        series: &Series,
        policy: &ReconcilePolicy,
        cancel: &CancellationToken,
        outcome: &mut SeriesOutcome,
    ) -> Result<()> {
        let sync = self.dispatcher.sync_backend_status(series.id).await?;
        if sync.checked > 0 {
            debug!(
                checked = sync.checked,
                completed = sync.completed,
                failed = sync.failed,
                unavailable = sync.unavailable,
                "Backend status synced"
            );
        }

        let query = SeriesQuery::from(series);
        let (items, errors) = tokio::select! {
            _ = cancel.cancelled() => {
                outcome.aborted = Some(CANCELLED.to_string());
                return Ok(());
            }
            fetched = self.sources.fetch_all(&query, &self.config.retry) => fetched,
        };
        outcome.fetched = items.len();
        outcome.fetch_errors = errors.iter().map(ToString::to_string).collect();

        let snapshot = LedgerSnapshot::new(self.db.list_records(Some(series.id)).await?);
        let reconciliation = reconcile_detailed(series, &items, &snapshot, policy);
        outcome.unparsed = reconciliation.failures.len();

        let save_path = save_path_for(&self.config.storage, &series.name);
        for decision in &reconciliation.decisions {
            let _ = self.event_tx.send(Event::Decided {
                key: decision.identity.key(),
                action: decision.action,
            });

            if !decision.action.is_dispatch() {
                outcome.record_skip(decision.action);
                continue;
            }
            if cancel.is_cancelled() {
                outcome.aborted = Some(CANCELLED.to_string());
                break;
            }

            match self.dispatcher.dispatch(decision, &save_path).await? {
                DispatchOutcome::Submitted { .. } => outcome.dispatched += 1,
                DispatchOutcome::SubmitFailed { .. } => outcome.submit_failed += 1,
                DispatchOutcome::Skipped(action) => outcome.record_skip(action),
            }
        }

        Ok(())
    }

    /// Run passes every `interval` until `cancel` fires
    ///
    /// The first pass starts immediately. A pass that fails is logged and
    /// the loop waits for the next tick.
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Periodic reconciliation started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_pass(&cancel).await {
                Ok(report) if report.cancelled => break,
                Ok(_) => {}
                Err(Error::ShuttingDown) => break,
                Err(e) => error!(error = %e, "Reconciliation pass failed"),
            }
        }

        info!("Periodic reconciliation stopped");
    }

    /// Stop accepting passes and record a clean shutdown
    ///
    /// Call after any running pass has returned; the database stays open so
    /// the handle can still be inspected.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down reconciler");
        self.accepting_passes.store(false, Ordering::SeqCst);
        self.db.set_clean_shutdown().await?;
        info!("Reconciler shut down cleanly");
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
