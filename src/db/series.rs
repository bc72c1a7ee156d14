//! Subscription CRUD operations.

use crate::config::SeriesConfig;
use crate::error::DatabaseError;
use crate::types::{FilterRules, Series, SeriesId};
use crate::{Error, Result};

use super::{Database, SeriesRow};

const SERIES_COLUMNS: &str = "id, name, keyword, active, include_patterns, exclude_patterns, \
     preferred_group, min_episode_centi";

impl Database {
    /// Subscribe to a series, or update the subscription with the same name
    ///
    /// Re-subscribing an unsubscribed series reactivates it with its ledger
    /// history intact.
    pub async fn subscribe(&self, config: &SeriesConfig) -> Result<SeriesId> {
        let now = chrono::Utc::now().timestamp();
        let include = serde_json::to_string(&config.filters.include)?;
        let exclude = serde_json::to_string(&config.filters.exclude)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO series (name, keyword, active, include_patterns, exclude_patterns,
                                preferred_group, min_episode_centi, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                keyword = excluded.keyword,
                active = excluded.active,
                include_patterns = excluded.include_patterns,
                exclude_patterns = excluded.exclude_patterns,
                preferred_group = excluded.preferred_group,
                min_episode_centi = excluded.min_episode_centi,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&config.name)
        .bind(&config.keyword)
        .bind(config.active)
        .bind(include)
        .bind(exclude)
        .bind(&config.filters.preferred_group)
        .bind(config.filters.min_episode.map(|e| i64::from(e.centi())))
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to subscribe series: {}",
                e
            )))
        })?;

        tracing::debug!(series = id, name = %config.name, "Subscription stored");
        Ok(SeriesId(id))
    }

    /// Replace the filter rules of a series
    pub async fn update_filters(&self, id: SeriesId, filters: &FilterRules) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let include = serde_json::to_string(&filters.include)?;
        let exclude = serde_json::to_string(&filters.exclude)?;

        let result = sqlx::query(
            r#"
            UPDATE series
            SET include_patterns = ?, exclude_patterns = ?, preferred_group = ?,
                min_episode_centi = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(include)
        .bind(exclude)
        .bind(&filters.preferred_group)
        .bind(filters.min_episode.map(|e| i64::from(e.centi())))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update filters: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::SeriesNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Stop reconciling a series
    ///
    /// The row and its ledger history stay; only `active` is cleared.
    pub async fn unsubscribe(&self, id: SeriesId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE series SET active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to unsubscribe series: {}",
                    e
                )))
            })?;

        if result.rows_affected() == 0 {
            return Err(Error::SeriesNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Get series by ID
    pub async fn get_series(&self, id: SeriesId) -> Result<Option<Series>> {
        let row = sqlx::query_as::<_, SeriesRow>(&format!(
            "SELECT {SERIES_COLUMNS} FROM series WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get series: {}",
                e
            )))
        })?;

        row.map(Series::try_from).transpose()
    }

    /// All active subscriptions, ordered by ID
    pub async fn list_active_series(&self) -> Result<Vec<Series>> {
        let rows = sqlx::query_as::<_, SeriesRow>(&format!(
            "SELECT {SERIES_COLUMNS} FROM series WHERE active = 1 ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list series: {}",
                e
            )))
        })?;

        rows.into_iter().map(Series::try_from).collect()
    }
}
