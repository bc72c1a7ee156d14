//! Properties of the reconciliation engine, exercised through the public API

mod common;

use bangumi_dl::{
    AcquisitionDecision, Action, EpisodeNumber, FilterRules, LedgerRecord, LedgerSnapshot,
    RawFeedItem, ReconcilePolicy, Series, SeriesId, SourceKind, reconcile,
};
use chrono::{TimeZone, Utc};
use common::item;

fn example(min_episode: Option<u32>) -> Series {
    Series {
        id: SeriesId(1),
        name: "Example".to_string(),
        keyword: None,
        active: true,
        filters: FilterRules {
            min_episode: min_episode.map(EpisodeNumber::from_whole),
            ..FilterRules::default()
        },
    }
}

fn policy() -> ReconcilePolicy {
    ReconcilePolicy::new(3, Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap())
}

fn scenario_items() -> Vec<RawFeedItem> {
    let s = SeriesId(1);
    vec![
        item(s, "[A] Example - 04 [1080p]", "magnet:?xt=urn:btih:e4a", 1, SourceKind::Mikan),
        item(s, "Example - 05 [1080p]", "magnet:?xt=urn:btih:e5x", 4, SourceKind::Nyaa),
        item(s, "[A] Example - 05 [1080p]", "magnet:?xt=urn:btih:e5a", 2, SourceKind::Mikan),
        item(s, "[B] Example - 05 [1080p]", "magnet:?xt=urn:btih:e5b", 3, SourceKind::Dmhy),
        item(s, "[A] Example - 06 [1080p]", "magnet:?xt=urn:btih:e6a", 9, SourceKind::Mikan),
    ]
}

fn summary(decisions: &[AcquisitionDecision]) -> Vec<(u32, Action, String)> {
    decisions
        .iter()
        .map(|d| (d.identity.episode.centi() / 100, d.action, d.item.uri.clone()))
        .collect()
}

#[test]
fn minimum_episode_scenario() {
    let series = example(Some(5));
    let decisions = reconcile(&series, &scenario_items(), &LedgerSnapshot::default(), &policy());

    assert_eq!(
        summary(&decisions),
        vec![
            (4, Action::SkipFiltered, "magnet:?xt=urn:btih:e4a".to_string()),
            (5, Action::Fetch, "magnet:?xt=urn:btih:e5a".to_string()),
            (6, Action::Fetch, "magnet:?xt=urn:btih:e6a".to_string()),
        ]
    );
    assert_eq!(decisions[1].identity.release_group.as_deref(), Some("A"));

    // Second pass: intent for 5 and 6 recorded, nothing acknowledged yet
    let now = policy().now;
    let ledger = LedgerSnapshot::new(
        decisions
            .iter()
            .filter(|d| d.action == Action::Fetch)
            .map(|d| LedgerRecord::pending(d, 1, now)),
    );
    let second = reconcile(&series, &scenario_items(), &ledger, &policy());
    let actions: Vec<Action> = second.iter().map(|d| d.action).collect();
    assert_eq!(
        actions,
        vec![Action::SkipFiltered, Action::SkipDuplicate, Action::SkipDuplicate]
    );
}

#[test]
fn reconcile_is_idempotent() {
    let series = example(Some(5));
    let ledger = LedgerSnapshot::default();

    let first = reconcile(&series, &scenario_items(), &ledger, &policy());
    let second = reconcile(&series, &scenario_items(), &ledger, &policy());
    assert_eq!(first, second);
}

#[test]
fn input_order_does_not_change_decisions() {
    let series = example(None);
    let expected = reconcile(&series, &scenario_items(), &LedgerSnapshot::default(), &policy());

    let mut items = scenario_items();
    for rotation in 0..items.len() {
        items.rotate_left(1);
        let decisions = reconcile(&series, &items, &LedgerSnapshot::default(), &policy());
        assert_eq!(decisions, expected, "rotation {rotation}");
    }

    items.reverse();
    let decisions = reconcile(&series, &items, &LedgerSnapshot::default(), &policy());
    assert_eq!(decisions, expected);
}

#[test]
fn identical_uris_across_sources_collapse() {
    let series = example(None);
    let s = SeriesId(1);
    let items = vec![
        item(s, "[A] Example - 07 [1080p]", "magnet:?xt=urn:btih:same", 5, SourceKind::Mikan),
        item(s, "[A] Example - 07 [1080p]", "magnet:?xt=urn:btih:same", 5, SourceKind::Nyaa),
        item(s, "[A] Example 07 1080p", "magnet:?xt=urn:btih:same", 6, SourceKind::Dmhy),
    ];

    let decisions = reconcile(&series, &items, &LedgerSnapshot::default(), &policy());
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].action, Action::Fetch);
    assert_eq!(decisions[0].item.source, SourceKind::Mikan);
}

#[test]
fn at_most_one_decision_per_episode() {
    let series = example(None);
    let decisions = reconcile(&series, &scenario_items(), &LedgerSnapshot::default(), &policy());

    let mut episodes: Vec<EpisodeNumber> = decisions.iter().map(|d| d.identity.episode).collect();
    let total = episodes.len();
    episodes.dedup();
    assert_eq!(episodes.len(), total);
    assert_eq!(
        decisions.iter().filter(|d| d.action.is_dispatch()).count(),
        3
    );
}
