//! Reconciliation engine
//!
//! Merges the feed items of one series across all sources, resolves their
//! identities, applies the series filters and consults the ledger to produce
//! one [`AcquisitionDecision`] per episode.
//!
//! Reconciliation is synchronous and never mutates anything: the ledger is
//! read through [`LedgerView`] and the current time is part of
//! [`ReconcilePolicy`]. Running it twice on the same input yields the same
//! decisions, and shuffling the input does not change them.

use crate::config::ReconcileConfig;
use crate::resolver::{ParseFailure, resolve};
use crate::types::{
    AcquisitionDecision, Action, EpisodeIdentity, EpisodeNumber, LedgerKey, LedgerRecord,
    LedgerStatus, RawFeedItem, Series,
};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Compiled size limit for user-supplied patterns
const PATTERN_SIZE_LIMIT: usize = 1024 * 1024;

/// Read-only access to the latest ledger record per key
pub trait LedgerView {
    /// Latest record for `key`, if any
    fn latest(&self, key: &LedgerKey) -> Option<&LedgerRecord>;
}

/// In-memory copy of the ledger records of one series
///
/// Built from [`LedgerStore::list`](crate::dispatch::LedgerStore::list) before
/// reconciling so that the engine itself never awaits.
#[derive(Clone, Debug, Default)]
pub struct LedgerSnapshot {
    records: HashMap<LedgerKey, LedgerRecord>,
}

impl LedgerSnapshot {
    /// Build a snapshot; when a key appears more than once the last record wins
    pub fn new(records: impl IntoIterator<Item = LedgerRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.key, r)).collect(),
        }
    }

    /// Number of keys in the snapshot
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl LedgerView for LedgerSnapshot {
    fn latest(&self, key: &LedgerKey) -> Option<&LedgerRecord> {
        self.records.get(key)
    }
}

/// Policy values consulted while deciding
#[derive(Clone, Debug)]
pub struct ReconcilePolicy {
    /// Submissions allowed per episode
    pub retry_limit: u32,
    /// Age after which a handle-less pending record counts as lost
    pub stale_pending_after: chrono::Duration,
    /// Reference time for staleness
    pub now: DateTime<Utc>,
    /// Treat every handle-less pending record as lost (first pass after a crash)
    pub unclean_recovery: bool,
    /// Lowercased keywords rejected for every series
    pub global_excludes: Vec<String>,
}

impl ReconcilePolicy {
    /// Policy with the given retry limit and defaults for everything else
    pub fn new(retry_limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            retry_limit,
            stale_pending_after: chrono::Duration::hours(1),
            now,
            unclean_recovery: false,
            global_excludes: Vec::new(),
        }
    }

    /// Policy derived from configuration
    pub fn from_config(config: &ReconcileConfig, now: DateTime<Utc>, unclean_recovery: bool) -> Self {
        let global_excludes = if config.enable_global_filters {
            config
                .global_filters
                .iter()
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .collect()
        } else {
            Vec::new()
        };

        Self {
            retry_limit: config.retry_limit,
            stale_pending_after: chrono::Duration::from_std(config.stale_pending_after)
                .unwrap_or(chrono::Duration::MAX),
            now,
            unclean_recovery,
            global_excludes,
        }
    }
}

/// Full result of reconciling one series
#[derive(Clone, Debug, Default)]
pub struct Reconciliation {
    /// Decisions in ascending episode order
    pub decisions: Vec<AcquisitionDecision>,
    /// Items dropped because their title names no single episode
    pub failures: Vec<ParseFailure>,
    /// Items dropped as duplicates of another item with the same URI
    pub collapsed: usize,
}

/// Decide what to do for every episode of `series` found in `items`
pub fn reconcile<L>(
    series: &Series,
    items: &[RawFeedItem],
    ledger: &L,
    policy: &ReconcilePolicy,
) -> Vec<AcquisitionDecision>
where
    L: LedgerView + ?Sized,
{
    reconcile_detailed(series, items, ledger, policy).decisions
}

/// Like [`reconcile`], also reporting dropped items
pub fn reconcile_detailed<L>(
    series: &Series,
    items: &[RawFeedItem],
    ledger: &L,
    policy: &ReconcilePolicy,
) -> Reconciliation
where
    L: LedgerView + ?Sized,
{
    let filters = SeriesFilters::compile(series, &policy.global_excludes);

    // Identical URIs collapse to the earliest item, independent of input order
    let mut unique: Vec<&RawFeedItem> = items
        .iter()
        .filter(|item| {
            let own = item.series == series.id;
            if !own {
                debug!(series = %series.id, other = %item.series, title = %item.title, "Ignoring item of another series");
            }
            own
        })
        .collect();
    let total = unique.len();
    unique.sort_by(|a, b| {
        a.uri
            .cmp(&b.uri)
            .then(a.published.cmp(&b.published))
            .then(a.title.cmp(&b.title))
            .then(a.source.cmp(&b.source))
    });
    unique.dedup_by(|later, earlier| later.uri == earlier.uri);
    let collapsed = total - unique.len();

    let mut failures = Vec::new();
    let mut episodes: BTreeMap<EpisodeNumber, Vec<Candidate<'_>>> = BTreeMap::new();
    for item in unique {
        match resolve(item, &series.name) {
            Ok(identity) => episodes
                .entry(identity.episode)
                .or_default()
                .push(Candidate { identity, item }),
            Err(failure) => {
                debug!(series = %series.id, title = %failure.title, reason = %failure.reason, "Dropping unresolvable feed item");
                failures.push(failure);
            }
        }
    }

    let decisions = episodes
        .into_iter()
        .filter_map(|(episode, candidates)| {
            decide_episode(series, episode, candidates, &filters, ledger, policy)
        })
        .collect();

    Reconciliation {
        decisions,
        failures,
        collapsed,
    }
}

struct Candidate<'a> {
    identity: EpisodeIdentity,
    item: &'a RawFeedItem,
}

impl Candidate<'_> {
    /// Earliest publication wins, then release group (named before unnamed),
    /// then URI
    fn tie_break_key(&self) -> (DateTime<Utc>, bool, Option<&str>, &str) {
        let group = self.identity.release_group.as_deref();
        (self.item.published, group.is_none(), group, &self.item.uri)
    }

    fn into_decision(self, action: Action, reason: Option<String>) -> AcquisitionDecision {
        AcquisitionDecision {
            identity: self.identity,
            action,
            item: self.item.clone(),
            reason,
        }
    }
}

fn decide_episode<L>(
    series: &Series,
    episode: EpisodeNumber,
    mut candidates: Vec<Candidate<'_>>,
    filters: &SeriesFilters,
    ledger: &L,
    policy: &ReconcilePolicy,
) -> Option<AcquisitionDecision>
where
    L: LedgerView + ?Sized,
{
    if let Some(preferred) = &filters.preferred_group {
        if candidates
            .iter()
            .any(|c| preferred.matches(c.identity.release_group.as_deref()))
        {
            candidates.retain(|c| preferred.matches(c.identity.release_group.as_deref()));
        }
    }
    candidates.sort_by(|a, b| a.tie_break_key().cmp(&b.tie_break_key()));

    if let Some(min) = filters.min_episode {
        if episode < min {
            debug!(series = %series.id, episode = %episode, minimum = %min, "Episode below minimum");
            let winner = candidates.into_iter().next()?;
            return Some(winner.into_decision(
                Action::SkipFiltered,
                Some(format!("episode {episode} below minimum {min}")),
            ));
        }
    }

    let mut first_rejection = None;
    let mut chosen = None;
    for candidate in candidates {
        match filters.rejection(&candidate.item.title) {
            None => {
                chosen = Some(candidate);
                break;
            }
            Some(reason) => {
                if first_rejection.is_none() {
                    first_rejection = Some((candidate, reason));
                }
            }
        }
    }

    let Some(chosen) = chosen else {
        let (winner, reason) = first_rejection?;
        debug!(series = %series.id, episode = %episode, title = %winner.item.title, reason = %reason, "Episode filtered");
        return Some(winner.into_decision(Action::SkipFiltered, Some(reason)));
    };

    let (action, reason) = ledger_action(ledger.latest(&chosen.identity.key()), policy);
    match action {
        Action::SkipExhausted => {
            warn!(series = %series.id, episode = %episode, reason = reason.as_deref().unwrap_or_default(), "Episode permanently skipped: retries exhausted");
        }
        _ => {
            debug!(series = %series.id, episode = %episode, action = %action, "Episode decided");
        }
    }
    Some(chosen.into_decision(action, reason))
}

/// Map the latest ledger record of a key to an action
fn ledger_action(record: Option<&LedgerRecord>, policy: &ReconcilePolicy) -> (Action, Option<String>) {
    let Some(record) = record else {
        return (Action::Fetch, None);
    };

    let exhausted = record.attempts >= policy.retry_limit;
    match record.status {
        LedgerStatus::Failed if exhausted => (
            Action::SkipExhausted,
            Some(format!(
                "failed {} of {} allowed attempts{}",
                record.attempts,
                policy.retry_limit,
                record
                    .last_error
                    .as_deref()
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            )),
        ),
        LedgerStatus::Failed => (
            Action::Retry,
            Some(format!(
                "attempt {} of {}",
                record.attempts + 1,
                policy.retry_limit
            )),
        ),
        LedgerStatus::Pending if record.handle.is_none() && is_lost(record, policy) => {
            if exhausted {
                (
                    Action::SkipExhausted,
                    Some(format!(
                        "submission lost after {} of {} allowed attempts",
                        record.attempts, policy.retry_limit
                    )),
                )
            } else {
                (
                    Action::Retry,
                    Some("pending submission was never confirmed".to_string()),
                )
            }
        }
        LedgerStatus::Pending | LedgerStatus::Downloading | LedgerStatus::Done => {
            (Action::SkipDuplicate, Some(format!("already {}", record.status)))
        }
    }
}

fn is_lost(record: &LedgerRecord, policy: &ReconcilePolicy) -> bool {
    policy.unclean_recovery
        || policy.now.signed_duration_since(record.updated_at) >= policy.stale_pending_after
}

/// Filter rules of one series, compiled once per reconciliation
struct SeriesFilters {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    preferred_group: Option<GroupMatcher>,
    min_episode: Option<EpisodeNumber>,
    global_excludes: Vec<String>,
}

impl SeriesFilters {
    fn compile(series: &Series, global_excludes: &[String]) -> Self {
        let rules = &series.filters;
        Self {
            include: compile_patterns(&rules.include, "include"),
            exclude: compile_patterns(&rules.exclude, "exclude"),
            preferred_group: rules
                .preferred_group
                .as_deref()
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(GroupMatcher::new),
            min_episode: rules.min_episode,
            global_excludes: global_excludes.iter().map(|kw| kw.to_lowercase()).collect(),
        }
    }

    /// Why `title` is rejected, or `None` when it passes
    fn rejection(&self, title: &str) -> Option<String> {
        if !self.global_excludes.is_empty() {
            let lower = title.to_lowercase();
            if let Some(keyword) = self.global_excludes.iter().find(|kw| lower.contains(kw.as_str())) {
                return Some(format!("matches global filter '{keyword}'"));
            }
        }
        if let Some(re) = self.exclude.iter().find(|re| re.is_match(title)) {
            return Some(format!("matches exclude pattern '{}'", re.as_str()));
        }
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(title)) {
            return Some("matches no include pattern".to_string());
        }
        None
    }
}

/// Compile case-insensitive patterns; invalid ones are logged and skipped
fn compile_patterns(patterns: &[String], kind: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .size_limit(PATTERN_SIZE_LIMIT)
                .build()
                .map_err(|e| {
                    warn!("Invalid {} regex pattern '{}': {}", kind, pattern, e);
                })
                .ok()
        })
        .collect()
}

/// Preferred release group: an anchored case-insensitive pattern, or the
/// literal name when it is not valid regex
enum GroupMatcher {
    Pattern(Regex),
    Literal(String),
}

impl GroupMatcher {
    fn new(preferred: &str) -> Self {
        match RegexBuilder::new(&format!("^(?:{preferred})$"))
            .case_insensitive(true)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
        {
            Ok(re) => GroupMatcher::Pattern(re),
            Err(e) => {
                warn!("Preferred group '{}' is not a valid pattern, matching literally: {}", preferred, e);
                GroupMatcher::Literal(preferred.to_lowercase())
            }
        }
    }

    fn matches(&self, group: Option<&str>) -> bool {
        let Some(group) = group else {
            return false;
        };
        match self {
            GroupMatcher::Pattern(re) => re.is_match(group),
            GroupMatcher::Literal(name) => group.to_lowercase() == *name,
        }
    }
}
