//! # bangumi-dl
//!
//! Subscription reconciler for anime torrent feeds.
//!
//! ## Design Philosophy
//!
//! bangumi-dl keeps a ledger of every episode it has asked a downloader for
//! and compares each feed listing against it. A physical episode is handed
//! to the backend at most once, no matter how many sources list it, how many
//! release groups publish it or how often a pass is re-run.
//!
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Backend-agnostic** - Transmission and aria2 behind one trait
//! - **Crash-safe** - Intent is recorded before a submission is made
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use bangumi_dl::{Config, Reconciler, SeriesConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         subscriptions: vec![SeriesConfig {
//!             name: "Frieren".to_string(),
//!             keyword: Some("葬送的芙莉莲".to_string()),
//!             filters: Default::default(),
//!             active: true,
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let reconciler = Reconciler::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = reconciler.subscribe_events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = reconciler.run_pass(&CancellationToken::new()).await?;
//!     println!("dispatched {} episodes", report.dispatched());
//!
//!     reconciler.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Downloader backends (Transmission, aria2)
pub mod backend;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Dispatch coordinator: ledger transitions around backend submissions
pub mod dispatch;
/// Error types
pub mod error;
/// Reconciliation pass runner
pub mod pass;
/// Reconciliation engine: feed items to acquisition decisions
pub mod reconcile;
/// Episode identity resolution from release titles
pub mod resolver;
/// Retry logic with exponential backoff
pub mod retry;
/// Source feed adapters
pub mod sources;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use backend::{BackendHandle, BackendState, DownloaderBackend, SubmitRequest, build_backend};
pub use config::{
    BackendConfig, Config, PersistenceConfig, ReconcileConfig, RetryConfig, SeriesConfig,
    SourceConfig, StorageConfig,
};
pub use db::Database;
pub use dispatch::{DispatchOutcome, Dispatcher, LedgerStore};
pub use error::{BackendError, DatabaseError, Error, FetchError, Result};
pub use pass::Reconciler;
pub use reconcile::{LedgerSnapshot, LedgerView, ReconcilePolicy, reconcile};
pub use resolver::{ParseFailure, resolve};
pub use sources::{FeedSource, RssFeedSource, SeriesQuery, SourceRegistry};
pub use types::{
    AcquisitionDecision, Action, EpisodeIdentity, EpisodeNumber, Event, FilterRules, LedgerKey,
    LedgerRecord, LedgerStatus, PassReport, RawFeedItem, Series, SeriesId, SeriesOutcome,
    SourceKind,
};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run passes every `interval` until a termination signal arrives.
///
/// On the signal the running pass is cancelled, awaited, and the
/// reconciler's `shutdown()` method is called.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use bangumi_dl::{Config, Reconciler, run_with_shutdown};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let reconciler = Arc::new(Reconciler::new(Config::default()).await?);
///
///     // Reconcile every 30 minutes until Ctrl+C
///     run_with_shutdown(reconciler, Duration::from_secs(30 * 60)).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(reconciler: Arc<Reconciler>, interval: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let runner = {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run_periodic(interval, cancel).await })
    };

    wait_for_signal().await;
    cancel.cancel();

    if let Err(e) = runner.await {
        tracing::error!(error = %e, "Reconciliation task did not stop cleanly");
    }
    reconciler.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
