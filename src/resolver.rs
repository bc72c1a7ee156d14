//! Episode identity resolution from release titles.
//!
//! Turns a [`RawFeedItem`] title such as
//! `[SubsPlease] Sousou no Frieren - 05 (1080p) [A1B2C3D4].mkv` into an
//! [`EpisodeIdentity`]. Resolution is pure: no I/O, no logging, same output
//! for the same input.
//!
//! The title is cleaned in stages before a number is picked:
//! 1. the leading `[Group]` / `【Group】` bracket and the series name are removed
//! 2. CRC hashes, bracketed years, resolution and codec tags are blanked
//! 3. `SxxEyy` is tried on what remains
//! 4. season markers and movie/volume/OVA numbers are blanked, batch
//!    ranges are rejected
//! 5. episode conventions are tried from most to least specific, ending with
//!    a lone standalone number

use crate::types::{EpisodeIdentity, EpisodeNumber, RawFeedItem};
use regex::{Regex, RegexBuilder};
use std::sync::LazyLock;
use thiserror::Error;

/// Leading release group: `[Group]` or `【Group】`
#[allow(clippy::expect_used)]
static GROUP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\[([^\]]+)\]|【([^】]+)】)").expect("group regex is valid") // Static pattern, safe to panic
});

/// Resolution tags: `1080p`, `4K`, `1920x1080`
#[allow(clippy::expect_used)]
static RESOLUTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:(2160|1080|720|480)p|(4k)|(\d{3,4})[x×](\d{3,4}))\b")
        .expect("resolution regex is valid") // Static pattern, safe to panic
});

/// Codec, container and source tags that carry digits or look like numbers
#[allow(clippy::expect_used)]
static CODEC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:x26[45]|h\.?26[45]|hevc|avc|aac(?:\d\.\d)?|flac|opus|e?ac-?3|ddp?\d\.\d|10-?bit|8-?bit|hi10p?|hdr|web-?dl|web-?rip|bd-?rip|blu-?ray|tv-?rip|mp4|mkv|avi)\b",
    )
    .expect("codec regex is valid") // Static pattern, safe to panic
});

/// CRC32 suffix such as `[A1B2C3D4]`
#[allow(clippy::expect_used)]
static HASH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[[0-9A-Fa-f]{8}\]").expect("hash regex is valid") // Static pattern, safe to panic
});

/// Bracketed airing year: `(2023)`, `[2024]`
#[allow(clippy::expect_used)]
static YEAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\[(（](?:19|20)\d{2}[\])）]").expect("year regex is valid") // Static pattern, safe to panic
});

/// Season markers: `S2`, `Season 2`, `2nd Season`, `Part 2`, `第二季`
#[allow(clippy::expect_used)]
static SEASON_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bS\d{1,2}\b|\bseason\s*\d{1,2}\b|\b\d{1,2}(?:st|nd|rd|th)\s+season\b|\b(?:part|cour)\s*\d{1,2}\b|第[一二三四五六七八九十\d]+[季期]",
    )
    .expect("season regex is valid") // Static pattern, safe to panic
});

/// Movie, volume and OVA numbering: `Movie 2`, `Vol.3`, `OVA 1`, `剧场版2`
#[allow(clippy::expect_used)]
static RELEASE_KIND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:movie|film|vol(?:ume)?\.?|ova|oad|special)\s*\d{1,2}\b|(?:剧场|劇場)版\s*\d{1,2}",
    )
    .expect("release kind regex is valid") // Static pattern, safe to panic
});

/// Episode ranges denoting a batch: `[01-12]`, `01~12 END`, `[01-12TV全集+SP]`,
/// `[01-12+OVA]`
///
/// Anything but another digit may follow the range, so collection tags
/// glued to the last number still count.
#[allow(clippy::expect_used)]
static BATCH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s\[【(（_])(\d{1,4})\s*[-~～]\s*(\d{1,4})(?:$|\D)")
        .expect("batch regex is valid") // Static pattern, safe to panic
});

/// CJK episode ranges: `第01-12话`
#[allow(clippy::expect_used)]
static CJK_BATCH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"第\s*(\d{1,4})\s*[-~～]\s*(\d{1,4})\s*[话話集]").expect("cjk batch regex is valid") // Static pattern, safe to panic
});

/// `S01E05`
#[allow(clippy::expect_used)]
static SEASON_EPISODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bS\d{1,2}E(\d{1,4}(?:\.\d{1,2})?)(?:v\d)?\b")
        .expect("season-episode regex is valid") // Static pattern, safe to panic
});

/// Episode conventions tried in order once the title is cleaned
#[allow(clippy::expect_used)]
static EPISODE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // 第05话 / 第05話 / 第05集
        r"第\s*(\d{1,4}(?:\.\d{1,2})?)\s*[话話集]",
        // [05] / [05v2] / [12END] / 【05】
        r"(?i)[\[【]\s*(\d{1,4}(?:\.\d{1,2})?)\s*(?:v\d)?\s*(?:END|完)?\s*[\]】]",
        // Show - 05 / Show - 07v2 / Show - 12 END
        r"(?i)\s-\s*(\d{1,4}(?:\.\d{1,2})?)(?:v\d)?(?:\s*END)?(?:\s|$|[\[(【])",
        // EP05 / E05 / Episode 5 / #05
        r"(?i)(?:\b(?:episode|ep|e)|#)\.?\s*(\d{1,4}(?:\.\d{1,2})?)(?:v\d)?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("episode regex is valid")) // Static pattern, safe to panic
    .collect()
});

/// Why a title could not be resolved to a single episode
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ParseFailureReason {
    /// Nothing in the title looks like an episode number
    #[error("no episode number found")]
    NoEpisodeNumber,

    /// Several standalone numbers and no convention to pick one
    #[error("ambiguous episode number (candidates: {0:?})")]
    Ambiguous(Vec<String>),

    /// The title denotes a range of episodes
    #[error("batch release covering episodes {first}-{last}")]
    BatchRelease {
        /// First episode of the range
        first: u32,
        /// Last episode of the range
        last: u32,
    },
}

/// A feed item whose title does not name exactly one episode
///
/// Non-fatal: the item is dropped from the pass and logged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("cannot resolve {title:?}: {reason}")]
pub struct ParseFailure {
    /// Offending title
    pub title: String,
    /// What went wrong
    pub reason: ParseFailureReason,
}

/// Resolve a raw feed item into an episode identity
///
/// `series_name` is stripped from the title before number extraction so
/// that digits in show names (`86`, `Kaiju No. 8`) are not mistaken for
/// episode numbers.
pub fn resolve(item: &RawFeedItem, series_name: &str) -> Result<EpisodeIdentity, ParseFailure> {
    let fail = |reason: ParseFailureReason| ParseFailure {
        title: item.title.clone(),
        reason,
    };

    let title = item.title.trim();
    let release_group = extract_group(title);
    let resolution = extract_resolution(title);

    let mut rest = GROUP_PATTERN.replace(title, " ").into_owned();
    if let Some(name) = series_name_pattern(series_name) {
        rest = name.replace_all(&rest, " ").into_owned();
    }
    for noise in [
        &*HASH_PATTERN,
        &*YEAR_PATTERN,
        &*RESOLUTION_PATTERN,
        &*CODEC_PATTERN,
    ] {
        rest = noise.replace_all(&rest, " ").into_owned();
    }

    let episode = match capture_episode(&SEASON_EPISODE_PATTERN, &rest) {
        Some(episode) => episode,
        None => {
            let rest = SEASON_PATTERN.replace_all(&rest, " ");
            let rest = RELEASE_KIND_PATTERN.replace_all(&rest, " ");
            if let Some((first, last)) = batch_range(&rest) {
                return Err(fail(ParseFailureReason::BatchRelease { first, last }));
            }
            match EPISODE_PATTERNS
                .iter()
                .find_map(|pattern| capture_episode(pattern, &rest))
            {
                Some(episode) => episode,
                None => lone_number(&rest).map_err(fail)?,
            }
        }
    };

    Ok(EpisodeIdentity {
        series: item.series,
        episode,
        release_group,
        resolution,
        source: item.source,
    })
}

/// Release group from the leading bracket, if present
pub fn extract_group(title: &str) -> Option<String> {
    let caps = GROUP_PATTERN.captures(title)?;
    let group = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
    (!group.is_empty()).then(|| group.to_string())
}

/// Normalized resolution tag (`1080p`, `2160p`, ...)
pub fn extract_resolution(title: &str) -> Option<String> {
    let caps = RESOLUTION_PATTERN.captures(title)?;
    if let Some(lines) = caps.get(1) {
        Some(format!("{}p", lines.as_str()))
    } else if caps.get(2).is_some() {
        Some("2160p".to_string())
    } else {
        caps.get(4).map(|height| format!("{}p", height.as_str()))
    }
}

fn series_name_pattern(series_name: &str) -> Option<Regex> {
    let name = series_name.trim();
    if name.is_empty() {
        return None;
    }
    RegexBuilder::new(&regex::escape(name))
        .case_insensitive(true)
        .build()
        .ok()
}

fn capture_episode(pattern: &Regex, text: &str) -> Option<EpisodeNumber> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| EpisodeNumber::parse(m.as_str()))
}

fn batch_range(text: &str) -> Option<(u32, u32)> {
    [&*CJK_BATCH_PATTERN, &*BATCH_PATTERN]
        .into_iter()
        .flat_map(|pattern| pattern.captures_iter(text))
        .find_map(|caps| {
            let first: u32 = caps.get(1)?.as_str().parse().ok()?;
            let last: u32 = caps.get(2)?.as_str().parse().ok()?;
            (first < last).then_some((first, last))
        })
}

/// Last resort: exactly one standalone number that is not a year
fn lone_number(text: &str) -> Result<EpisodeNumber, ParseFailureReason> {
    let mut candidates: Vec<(EpisodeNumber, &str)> = Vec::new();
    for token in text.split(|c: char| !(c.is_alphanumeric() || c == '.')) {
        let token = token.trim_matches('.');
        let Some(number) = bare_number(token) else {
            continue;
        };
        if !candidates.iter().any(|(n, _)| *n == number) {
            candidates.push((number, token));
        }
    }

    match candidates.as_slice() {
        [] => Err(ParseFailureReason::NoEpisodeNumber),
        [(number, _)] => Ok(*number),
        many => Err(ParseFailureReason::Ambiguous(
            many.iter().map(|(_, token)| token.to_string()).collect(),
        )),
    }
}

fn bare_number(token: &str) -> Option<EpisodeNumber> {
    let token = match token.rsplit_once(['v', 'V']) {
        Some((number, version))
            if version.len() == 1 && version.bytes().all(|b| b.is_ascii_digit()) =>
        {
            number
        }
        _ => token,
    };
    if token.len() == 4 && !token.contains('.') {
        if let Ok(year) = token.parse::<u32>() {
            if (1900..=2099).contains(&year) {
                return None;
            }
        }
    }
    EpisodeNumber::parse(token)
}
