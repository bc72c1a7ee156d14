//! Configuration types for bangumi-dl

use crate::error::{Error, Result};
use crate::types::{FilterRules, SourceKind};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Main configuration for the reconciler
///
/// Every section has sensible defaults; an empty JSON object is a valid
/// configuration (no subscriptions, no sources, Transmission on localhost).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Subscribed series, upserted into the database at startup
    #[serde(default)]
    pub subscriptions: Vec<SeriesConfig>,

    /// Feed sources queried for every active series
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Downloader backend
    #[serde(default)]
    pub backend: BackendConfig,

    /// Reconciliation policy
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// In-call backoff for transient fetch/submit failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Where downloads are saved
    #[serde(default)]
    pub storage: StorageConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.reconcile.fetch_concurrency == 0 {
            return Err(Error::Config {
                message: "fetch_concurrency must be at least 1".into(),
                key: Some("reconcile.fetch_concurrency".into()),
            });
        }
        if self.reconcile.retry_limit == 0 {
            return Err(Error::Config {
                message: "retry_limit must be at least 1".into(),
                key: Some("reconcile.retry_limit".into()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: "backoff_multiplier must be >= 1.0".into(),
                key: Some("retry.backoff_multiplier".into()),
            });
        }

        let mut names = std::collections::HashSet::new();
        for sub in &self.subscriptions {
            if sub.name.trim().is_empty() {
                return Err(Error::Config {
                    message: "subscription name must not be empty".into(),
                    key: Some("subscriptions.name".into()),
                });
            }
            if !names.insert(sub.name.as_str()) {
                return Err(Error::Config {
                    message: format!("duplicate subscription '{}'", sub.name),
                    key: Some("subscriptions.name".into()),
                });
            }
        }

        let mut kinds = std::collections::HashSet::new();
        for source in &self.sources {
            if !source.url_template.contains("{keyword}") {
                return Err(Error::Config {
                    message: format!("{} url_template has no {{keyword}} placeholder", source.kind),
                    key: Some("sources.url_template".into()),
                });
            }
            if !kinds.insert(source.kind) {
                return Err(Error::Config {
                    message: format!("source {} configured twice", source.kind),
                    key: Some("sources.kind".into()),
                });
            }
        }

        Ok(())
    }
}

/// A subscription as written in the configuration file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesConfig {
    /// Display name (unique)
    pub name: String,

    /// Search keyword sent to sources (defaults to the name)
    #[serde(default)]
    pub keyword: Option<String>,

    /// Filter rules
    #[serde(flatten)]
    pub filters: FilterRules,

    /// Set to false to unsubscribe while keeping history
    #[serde(default = "default_true")]
    pub active: bool,
}

/// One feed source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source kind (one adapter instance per kind)
    pub kind: SourceKind,

    /// Feed URL with a `{keyword}` placeholder, e.g.
    /// `https://nyaa.si/?page=rss&q={keyword}`
    pub url_template: String,

    /// Request timeout (default: 30 seconds)
    #[serde(default = "default_fetch_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Whether the source is queried
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Downloader backend selection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Transmission RPC
    Transmission {
        /// RPC endpoint (default: http://127.0.0.1:9091/transmission/rpc)
        #[serde(default = "default_transmission_url")]
        rpc_url: String,
        /// RPC username
        #[serde(default)]
        username: Option<String>,
        /// RPC password
        #[serde(default)]
        password: Option<String>,
    },

    /// aria2 JSON-RPC
    Aria2 {
        /// RPC endpoint (default: http://127.0.0.1:6800/jsonrpc)
        #[serde(default = "default_aria2_url")]
        rpc_url: String,
        /// `--rpc-secret` token
        #[serde(default)]
        secret: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Transmission {
            rpc_url: default_transmission_url(),
            username: None,
            password: None,
        }
    }
}

/// Reconciliation policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Submissions allowed per episode before it is abandoned (default: 3)
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Series reconciled concurrently (default: 4)
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Pending records without a handle older than this are re-submitted
    /// (default: 1 hour)
    #[serde(default = "default_stale_pending_after", with = "duration_serde")]
    pub stale_pending_after: Duration,

    /// Apply `global_filters` to every series
    #[serde(default)]
    pub enable_global_filters: bool,

    /// Case-insensitive keywords rejected for every series
    #[serde(default = "default_global_filters")]
    pub global_filters: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retry_limit: default_retry_limit(),
            fetch_concurrency: default_fetch_concurrency(),
            stale_pending_after: default_stale_pending_after(),
            enable_global_filters: false,
            global_filters: default_global_filters(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of in-call retries (default: 2)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No in-call retries
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            jitter: false,
            ..Self::default()
        }
    }
}

/// Download location configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all series (default: "./bangumi")
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,

    /// Per-series overrides keyed by normalized series name; relative paths
    /// are joined onto `save_path`
    #[serde(default)]
    pub save_path_map: HashMap<String, PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            save_path: default_save_path(),
            save_path_map: HashMap::new(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./bangumi-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_transmission_url() -> String {
    "http://127.0.0.1:9091/transmission/rpc".to_string()
}

fn default_aria2_url() -> String {
    "http://127.0.0.1:6800/jsonrpc".to_string()
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_limit() -> u32 {
    3
}

fn default_fetch_concurrency() -> usize {
    4
}

fn default_stale_pending_after() -> Duration {
    Duration::from_secs(3600)
}

fn default_global_filters() -> Vec<String> {
    vec!["合集".to_string(), "劇場版".to_string(), "剧场版".to_string()]
}

fn default_max_attempts() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_save_path() -> PathBuf {
    PathBuf::from("bangumi")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("bangumi-dl.db")
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
