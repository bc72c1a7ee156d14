//! Database layer for bangumi-dl
//!
//! Handles SQLite persistence for subscriptions and the acquisition ledger.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`series`] - Subscription CRUD
//! - [`ledger`] - Acquisition ledger (append-only, latest row per key wins)
//! - [`state`] - Runtime state (shutdown tracking)

use crate::error::DatabaseError;
use crate::types::{
    EpisodeNumber, FilterRules, LedgerKey, LedgerRecord, LedgerStatus, Series, SeriesId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod ledger;
mod migrations;
mod series;
mod state;

/// Series row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct SeriesRow {
    id: i64,
    name: String,
    keyword: Option<String>,
    active: bool,
    /// JSON array of regex patterns
    include_patterns: String,
    /// JSON array of regex patterns
    exclude_patterns: String,
    preferred_group: Option<String>,
    /// Episode number in hundredths
    min_episode_centi: Option<i64>,
}

impl TryFrom<SeriesRow> for Series {
    type Error = Error;

    fn try_from(row: SeriesRow) -> Result<Self> {
        let include: Vec<String> = serde_json::from_str(&row.include_patterns)?;
        let exclude: Vec<String> = serde_json::from_str(&row.exclude_patterns)?;
        let min_episode = row
            .min_episode_centi
            .map(|centi| centi_to_episode(centi))
            .transpose()?;

        Ok(Series {
            id: SeriesId(row.id),
            name: row.name,
            keyword: row.keyword,
            active: row.active,
            filters: FilterRules {
                include,
                exclude,
                preferred_group: row.preferred_group,
                min_episode,
            },
        })
    }
}

/// Ledger row as stored
#[derive(Debug, Clone, FromRow)]
pub(crate) struct LedgerRow {
    series_id: i64,
    episode_centi: i64,
    release_group: Option<String>,
    resolution: Option<String>,
    source_kind: String,
    title: String,
    uri: String,
    status: i32,
    handle: Option<String>,
    attempts: i64,
    last_error: Option<String>,
    /// Unix timestamp in milliseconds
    updated_at: i64,
}

impl TryFrom<LedgerRow> for LedgerRecord {
    type Error = Error;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let source = row.source_kind.parse().map_err(|e: String| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Corrupt ledger row: {}",
                e
            )))
        })?;
        let updated_at = DateTime::<Utc>::from_timestamp_millis(row.updated_at).ok_or_else(|| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Corrupt ledger row: timestamp {} out of range",
                row.updated_at
            )))
        })?;

        Ok(LedgerRecord {
            key: LedgerKey::new(SeriesId(row.series_id), centi_to_episode(row.episode_centi)?),
            release_group: row.release_group,
            resolution: row.resolution,
            source,
            title: row.title,
            uri: row.uri,
            status: LedgerStatus::from_i32(row.status),
            handle: row.handle,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            last_error: row.last_error,
            updated_at,
        })
    }
}

fn centi_to_episode(centi: i64) -> Result<EpisodeNumber> {
    u32::try_from(centi).map(EpisodeNumber::from_centi).map_err(|_| {
        Error::Database(DatabaseError::QueryFailed(format!(
            "Corrupt episode number: {}",
            centi
        )))
    })
}

/// Database handle for bangumi-dl
pub struct Database {
    pool: SqlitePool,
}
