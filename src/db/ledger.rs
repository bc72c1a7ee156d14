//! Acquisition ledger persistence.

use crate::dispatch::LedgerStore;
use crate::error::DatabaseError;
use crate::types::{LedgerKey, LedgerRecord, SeriesId};
use crate::{Error, Result};
use async_trait::async_trait;

use super::{Database, LedgerRow};

const LEDGER_COLUMNS: &str = "series_id, episode_centi, release_group, resolution, source_kind, \
     title, uri, status, handle, attempts, last_error, updated_at";

impl Database {
    /// Latest record for one episode
    pub async fn get_latest(&self, key: &LedgerKey) -> Result<Option<LedgerRecord>> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!(
            r#"
            SELECT {LEDGER_COLUMNS}
            FROM ledger_records
            WHERE series_id = ? AND episode_centi = ?
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(key.series)
        .bind(i64::from(key.episode.centi()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get ledger record: {}",
                e
            )))
        })?;

        row.map(LedgerRecord::try_from).transpose()
    }

    /// Append a record; it becomes the latest state of its key
    ///
    /// A single INSERT, so the write is atomic per key.
    pub async fn put_record(&self, record: &LedgerRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO ledger_records ({LEDGER_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        ))
        .bind(record.key.series)
        .bind(i64::from(record.key.episode.centi()))
        .bind(&record.release_group)
        .bind(&record.resolution)
        .bind(record.source.as_str())
        .bind(&record.title)
        .bind(&record.uri)
        .bind(record.status.to_i32())
        .bind(&record.handle)
        .bind(i64::from(record.attempts))
        .bind(&record.last_error)
        .bind(record.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write ledger record: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Latest record of every episode, optionally for one series
    pub async fn list_records(&self, series: Option<SeriesId>) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            r#"
            SELECT {LEDGER_COLUMNS}
            FROM ledger_records
            WHERE id IN (
                SELECT MAX(id) FROM ledger_records
                WHERE ? IS NULL OR series_id = ?
                GROUP BY series_id, episode_centi
            )
            ORDER BY series_id ASC, episode_centi ASC
            "#
        ))
        .bind(series)
        .bind(series)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list ledger records: {}",
                e
            )))
        })?;

        rows.into_iter().map(LedgerRecord::try_from).collect()
    }

    /// Every record written for one episode, oldest first
    pub async fn history(&self, key: &LedgerKey) -> Result<Vec<LedgerRecord>> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            r#"
            SELECT {LEDGER_COLUMNS}
            FROM ledger_records
            WHERE series_id = ? AND episode_centi = ?
            ORDER BY id ASC
            "#
        ))
        .bind(key.series)
        .bind(i64::from(key.episode.centi()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get ledger history: {}",
                e
            )))
        })?;

        rows.into_iter().map(LedgerRecord::try_from).collect()
    }
}

#[async_trait]
impl LedgerStore for Database {
    async fn get(&self, key: &LedgerKey) -> Result<Option<LedgerRecord>> {
        self.get_latest(key).await
    }

    async fn put(&self, record: &LedgerRecord) -> Result<()> {
        self.put_record(record).await
    }

    async fn list(&self, series: Option<SeriesId>) -> Result<Vec<LedgerRecord>> {
        self.list_records(series).await
    }
}
