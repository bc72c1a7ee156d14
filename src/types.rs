//! Core types for bangumi-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a subscribed series
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SeriesId(pub i64);

impl SeriesId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for SeriesId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for SeriesId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for SeriesId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for SeriesId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Episode number with two decimal places of precision
///
/// Stored as hundredths so that `01`, `1` and `1.0` compare equal and
/// specials such as `12.5` keep a total order between 12 and 13.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeNumber(u32);

impl EpisodeNumber {
    /// Largest whole episode number accepted from a title
    pub const MAX_WHOLE: u32 = 9999;

    /// Build from a whole episode number
    pub fn from_whole(n: u32) -> Self {
        Self(n * 100)
    }

    /// Build from hundredths (database representation)
    pub fn from_centi(centi: u32) -> Self {
        Self(centi)
    }

    /// Hundredths representation
    pub fn centi(&self) -> u32 {
        self.0
    }

    /// Whether this is a fractional special (e.g. 12.5)
    pub fn is_special(&self) -> bool {
        self.0 % 100 != 0
    }

    /// Parse a numeric token such as `01`, `7`, `12.5`
    ///
    /// Returns `None` for anything that is not a plain decimal number with at
    /// most two fractional digits.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        let (whole, frac) = match token.split_once('.') {
            Some((w, f)) => (w, f),
            None => (token, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if token.contains('.') && frac.is_empty() {
            return None;
        }
        let whole: u32 = whole.parse().ok()?;
        if whole > Self::MAX_WHOLE {
            return None;
        }
        let frac: u32 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u32>().ok()? * 10,
            _ => frac.parse().ok()?,
        };
        Some(Self(whole * 100 + frac))
    }

    fn as_f64(&self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for EpisodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / 100;
        let frac = self.0 % 100;
        if frac == 0 {
            write!(f, "{whole}")
        } else if frac % 10 == 0 {
            write!(f, "{whole}.{}", frac / 10)
        } else {
            write!(f, "{whole}.{frac:02}")
        }
    }
}

impl Serialize for EpisodeNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_special() {
            serializer.serialize_f64(self.as_f64())
        } else {
            serializer.serialize_u32(self.0 / 100)
        }
    }
}

impl<'de> Deserialize<'de> for EpisodeNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Float(f64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Int(n) if n <= Self::MAX_WHOLE => Some(Self::from_whole(n)),
            Raw::Int(_) => None,
            Raw::Float(x) if x.is_finite() && x >= 0.0 => {
                EpisodeNumber::parse(&format!("{:.2}", x))
            }
            Raw::Float(_) => None,
            Raw::Text(s) => EpisodeNumber::parse(&s),
        };
        parsed.ok_or_else(|| serde::de::Error::custom("invalid episode number"))
    }
}

/// Kind of external feed a raw item came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// mikanani.me RSS
    Mikan,
    /// bangumi.moe RSS
    BangumiMoe,
    /// share.dmhy.org RSS
    Dmhy,
    /// nyaa.si RSS
    Nyaa,
    /// Any other RSS/Atom feed
    Rss,
}

impl SourceKind {
    /// Stable lowercase name (database and log representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Mikan => "mikan",
            SourceKind::BangumiMoe => "bangumi_moe",
            SourceKind::Dmhy => "dmhy",
            SourceKind::Nyaa => "nyaa",
            SourceKind::Rss => "rss",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mikan" => Ok(SourceKind::Mikan),
            "bangumi_moe" => Ok(SourceKind::BangumiMoe),
            "dmhy" => Ok(SourceKind::Dmhy),
            "nyaa" => Ok(SourceKind::Nyaa),
            "rss" => Ok(SourceKind::Rss),
            other => Err(format!("unknown source kind: {other}")),
        }
    }
}

/// Per-series filter rules
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    /// Regex patterns; when non-empty a title must match at least one
    #[serde(default)]
    pub include: Vec<String>,

    /// Regex patterns; a title matching any of them is rejected
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Preferred release group (name or regex, case-insensitive)
    #[serde(default)]
    pub preferred_group: Option<String>,

    /// Episodes below this number are rejected
    #[serde(default)]
    pub min_episode: Option<EpisodeNumber>,
}

impl FilterRules {
    /// True when no rule is configured (accept everything)
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.preferred_group.is_none()
            && self.min_episode.is_none()
    }
}

/// A subscribed show
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    /// Database ID
    pub id: SeriesId,
    /// Display name; also stripped from titles before number extraction
    pub name: String,
    /// Search keyword sent to sources (defaults to the name)
    pub keyword: Option<String>,
    /// False once unsubscribed (history is retained)
    pub active: bool,
    /// Filter rules
    pub filters: FilterRules,
}

impl Series {
    /// Keyword used when querying sources
    pub fn search_keyword(&self) -> &str {
        self.keyword.as_deref().unwrap_or(&self.name)
    }
}

/// One item as returned by a source feed, before any interpretation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedItem {
    /// Series the item was fetched for
    pub series: SeriesId,
    /// Release title
    pub title: String,
    /// Magnet or torrent URI
    pub uri: String,
    /// Publication time (items without a date sort last)
    pub published: DateTime<Utc>,
    /// Source the item came from
    pub source: SourceKind,
}

/// Structured identity resolved from a raw feed item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeIdentity {
    /// Series reference
    pub series: SeriesId,
    /// Normalized episode number
    pub episode: EpisodeNumber,
    /// Release group from the leading bracket, if any
    pub release_group: Option<String>,
    /// Resolution tag such as `1080p`
    pub resolution: Option<String>,
    /// Source the item came from
    pub source: SourceKind,
}

impl EpisodeIdentity {
    /// Deduplication key of this identity
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.series, self.episode)
    }
}

/// Ledger key: one physical episode of one series
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    /// Series reference
    pub series: SeriesId,
    /// Episode number
    pub episode: EpisodeNumber,
}

impl LedgerKey {
    /// Create a new key
    pub fn new(series: SeriesId, episode: EpisodeNumber) -> Self {
        Self { series, episode }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "series {} episode {}", self.series, self.episode)
    }
}

/// Acquisition status of a ledger record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    /// Intent recorded, backend not yet confirmed
    Pending,
    /// Accepted by the backend
    Downloading,
    /// Completed (terminal)
    Done,
    /// Submission or download failed
    Failed,
}

impl LedgerStatus {
    /// Convert integer status code to LedgerStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => LedgerStatus::Pending,
            1 => LedgerStatus::Downloading,
            2 => LedgerStatus::Done,
            _ => LedgerStatus::Failed,
        }
    }

    /// Convert LedgerStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            LedgerStatus::Pending => 0,
            LedgerStatus::Downloading => 1,
            LedgerStatus::Done => 2,
            LedgerStatus::Failed => 3,
        }
    }

    /// Pending, downloading and done records block a new acquisition
    pub fn is_active(&self) -> bool {
        !matches!(self, LedgerStatus::Failed)
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Downloading => "downloading",
            LedgerStatus::Done => "done",
            LedgerStatus::Failed => "failed",
        })
    }
}

/// Latest known acquisition state of one episode
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Series + episode
    pub key: LedgerKey,
    /// Release group of the submitted item
    pub release_group: Option<String>,
    /// Resolution of the submitted item
    pub resolution: Option<String>,
    /// Source of the submitted item
    pub source: SourceKind,
    /// Title of the submitted item
    pub title: String,
    /// URI handed to the backend
    pub uri: String,
    /// Current status
    pub status: LedgerStatus,
    /// Backend handle once accepted
    pub handle: Option<String>,
    /// Number of submissions started for this key
    pub attempts: u32,
    /// Last failure description
    pub last_error: Option<String>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// A fresh `pending` record for a decision that is about to be submitted
    pub fn pending(decision: &AcquisitionDecision, attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            key: decision.identity.key(),
            release_group: decision.identity.release_group.clone(),
            resolution: decision.identity.resolution.clone(),
            source: decision.identity.source,
            title: decision.item.title.clone(),
            uri: decision.item.uri.clone(),
            status: LedgerStatus::Pending,
            handle: None,
            attempts,
            last_error: None,
            updated_at: now,
        }
    }

    /// Copy of this record moved to `status`
    pub fn with_status(&self, status: LedgerStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// What the reconciliation engine decided for one episode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Never seen: submit
    Fetch,
    /// Supersedes a failed (or stale pending) record: submit again
    Retry,
    /// Already pending, downloading or done
    SkipDuplicate,
    /// Rejected by filter rules
    SkipFiltered,
    /// Retry budget used up; permanently abandoned
    SkipExhausted,
}

impl Action {
    /// Whether the dispatcher calls the backend for this action
    pub fn is_dispatch(&self) -> bool {
        matches!(self, Action::Fetch | Action::Retry)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Fetch => "fetch",
            Action::Retry => "retry",
            Action::SkipDuplicate => "skip-duplicate",
            Action::SkipFiltered => "skip-filtered",
            Action::SkipExhausted => "skip-exhausted",
        })
    }
}

/// Decision for one episode of one series in one pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionDecision {
    /// Resolved identity of the chosen item
    pub identity: EpisodeIdentity,
    /// What to do
    pub action: Action,
    /// The chosen feed item
    pub item: RawFeedItem,
    /// Why a skip was decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-series summary of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesOutcome {
    /// Series reference
    pub series: SeriesId,
    /// Series name
    pub name: String,
    /// Raw items fetched across all sources
    pub fetched: usize,
    /// Items dropped because no episode number could be resolved
    pub unparsed: usize,
    /// Submissions accepted by the backend
    pub dispatched: usize,
    /// Submissions the backend rejected (record marked failed)
    pub submit_failed: usize,
    /// Skipped as already acquired or in flight
    pub skipped_duplicate: usize,
    /// Skipped by filter rules
    pub skipped_filtered: usize,
    /// Skipped because retries are exhausted
    pub skipped_exhausted: usize,
    /// Sources that failed for this series
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetch_errors: Vec<String>,
    /// Set when the series pass was aborted (ledger write failure, cancellation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl SeriesOutcome {
    /// Empty outcome for a series
    pub fn new(series: &Series) -> Self {
        Self {
            series: series.id,
            name: series.name.clone(),
            ..Self::default()
        }
    }

    /// Count a reporting-only decision
    pub fn record_skip(&mut self, action: Action) {
        match action {
            Action::SkipDuplicate => self.skipped_duplicate += 1,
            Action::SkipFiltered => self.skipped_filtered += 1,
            Action::SkipExhausted => self.skipped_exhausted += 1,
            Action::Fetch | Action::Retry => {}
        }
    }
}

/// Result of one reconciliation pass over all active series
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Per-series outcomes ordered by series ID
    pub series: Vec<SeriesOutcome>,
    /// Whether the pass was cancelled before finishing
    pub cancelled: bool,
}

impl PassReport {
    /// Total accepted submissions
    pub fn dispatched(&self) -> usize {
        self.series.iter().map(|s| s.dispatched).sum()
    }

    /// Outcome for one series
    pub fn outcome(&self, series: SeriesId) -> Option<&SeriesOutcome> {
        self.series.iter().find(|s| s.series == series)
    }
}

/// Event emitted during a reconciliation pass
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A pass started
    PassStarted {
        /// Number of active series
        series_count: usize,
    },

    /// A decision was produced
    Decided {
        /// Ledger key
        key: LedgerKey,
        /// Decided action
        action: Action,
    },

    /// The backend accepted a submission
    Dispatched {
        /// Ledger key
        key: LedgerKey,
        /// Backend handle
        handle: String,
    },

    /// The backend rejected a submission
    SubmitFailed {
        /// Ledger key
        key: LedgerKey,
        /// Attempts used so far
        attempts: u32,
        /// Failure description
        error: String,
    },

    /// A ledger record reached `done`
    Completed {
        /// Ledger key
        key: LedgerKey,
    },

    /// One series finished its pass
    SeriesFinished {
        /// Summary
        outcome: SeriesOutcome,
    },

    /// The pass finished
    PassFinished {
        /// Whether it was cancelled
        cancelled: bool,
    },
}
