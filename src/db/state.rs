//! Runtime state tracking: shutdown detection.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const CLEAN_SHUTDOWN: &str = "clean_shutdown";

impl Database {
    /// Check if the last shutdown was unclean
    ///
    /// True when the previous session started but never reached
    /// [`set_clean_shutdown`](Self::set_clean_shutdown). Pending ledger
    /// records left by such a session may never have reached the backend.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
                .bind(CLEAN_SHUTDOWN)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to check shutdown state: {}",
                        e
                    )))
                })?;

        // If the value is missing or "false", it was an unclean shutdown
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Mark the session as running
    ///
    /// Called when the reconciler starts, after the previous state was read.
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_runtime_flag(CLEAN_SHUTDOWN, false).await
    }

    /// Mark that the session is shutting down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_runtime_flag(CLEAN_SHUTDOWN, true).await
    }

    async fn set_runtime_flag(&self, key: &str, value: bool) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let value = if value { "true" } else { "false" };
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update runtime state '{}': {}",
                key, e
            )))
        })?;

        Ok(())
    }
}
