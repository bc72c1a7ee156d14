//! Source feed adapters
//!
//! Every site is reached through the same capability, [`FeedSource`]. The
//! [`SourceRegistry`] maps each [`SourceKind`] to one adapter instance and
//! fans a series query out to all of them.
//!
//! A failing adapter only costs its own items: [`SourceRegistry::fetch_all`]
//! returns whatever the other sources produced together with the errors.

use crate::config::{RetryConfig, SourceConfig};
use crate::error::FetchError;
use crate::retry::with_retry;
use crate::types::{RawFeedItem, Series, SeriesId, SourceKind};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

mod feed;

pub use feed::RssFeedSource;

/// What a source is asked for one series
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeriesQuery {
    /// Series the returned items are tagged with
    pub series: SeriesId,
    /// Search keyword sent to the site
    pub keyword: String,
}

impl From<&Series> for SeriesQuery {
    fn from(series: &Series) -> Self {
        Self {
            series: series.id,
            keyword: series.search_keyword().to_string(),
        }
    }
}

/// Source feed adapter capability
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Kind this adapter serves; items it returns carry the same tag
    fn kind(&self) -> SourceKind;

    /// Fetch the current listing for one series
    ///
    /// Items whose URI cannot be determined are dropped by the adapter.
    /// Title parsing is not the adapter's job.
    async fn fetch(&self, query: &SeriesQuery) -> Result<Vec<RawFeedItem>, FetchError>;
}

/// Registry of adapters keyed by source kind
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<SourceKind, Arc<dyn FeedSource>>,
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration, skipping disabled sources
    ///
    /// Every configured kind is served by the generic RSS/Atom adapter with
    /// the configured URL template.
    pub fn from_config(configs: &[SourceConfig]) -> Result<Self, FetchError> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            let source = RssFeedSource::new(config.kind, &config.url_template, config.timeout)?;
            registry.register(Arc::new(source));
        }
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one of the same kind
    pub fn register(&mut self, source: Arc<dyn FeedSource>) -> Option<Arc<dyn FeedSource>> {
        let kind = source.kind();
        let previous = self.sources.insert(kind, source);
        if previous.is_some() {
            tracing::debug!(source = %kind, "Replaced feed source adapter");
        }
        previous
    }

    /// Adapter registered for `kind`
    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn FeedSource>> {
        self.sources.get(&kind).cloned()
    }

    /// Registered kinds, in stable order
    pub fn kinds(&self) -> Vec<SourceKind> {
        self.sources.keys().copied().collect()
    }

    /// Number of registered adapters
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no adapter is registered
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Query every registered source concurrently
    ///
    /// Transient failures are retried per `retry`. Items are returned in
    /// source-kind order; the reconciler does not depend on it.
    pub async fn fetch_all(
        &self,
        query: &SeriesQuery,
        retry: &RetryConfig,
    ) -> (Vec<RawFeedItem>, Vec<FetchError>) {
        let fetches = self.sources.values().map(|source| async move {
            let result = with_retry(retry, || source.fetch(query)).await;
            (source.kind(), result)
        });

        let mut items = Vec::new();
        let mut errors = Vec::new();
        for (kind, result) in join_all(fetches).await {
            match result {
                Ok(mut fetched) => {
                    tracing::debug!(series = %query.series, source = %kind, items = fetched.len(), "Fetched feed");
                    // Adapters must not tag items for another series
                    fetched.retain(|item| item.series == query.series);
                    items.append(&mut fetched);
                }
                Err(e) => {
                    tracing::warn!(series = %query.series, source = %kind, error = %e, "Feed source failed");
                    errors.push(e);
                }
            }
        }
        (items, errors)
    }
}
