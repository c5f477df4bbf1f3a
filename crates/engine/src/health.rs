//! Health tracking: consecutive failures per (destination, subscription).
//!
//! A missing row means zero failures. Failures increment the counter and
//! remember the last error; any success clears the row back to zero. The
//! returned state drives [`RecoveryPolicy`], which decides on alerts and
//! selector recovery.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use watchpost_common::error::StoreError;
use watchpost_common::types::{HealthState, SubscriptionKind, from_db_timestamp, to_db_timestamp};

#[derive(sqlx::FromRow)]
struct HealthRow {
    destination_key: String,
    subscription_url: String,
    consecutive_failures: i64,
    last_error: Option<String>,
    last_failure_at: Option<String>,
}

impl From<HealthRow> for HealthState {
    fn from(row: HealthRow) -> Self {
        Self {
            destination_key: row.destination_key,
            subscription_url: row.subscription_url,
            consecutive_failures: u32::try_from(row.consecutive_failures.max(0)).unwrap_or(u32::MAX),
            last_error: row.last_error,
            last_failure_at: row.last_failure_at.as_deref().and_then(from_db_timestamp),
        }
    }
}

/// SQLite-backed health store.
#[derive(Clone)]
pub struct HealthTracker {
    pool: SqlitePool,
}

impl HealthTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current state, or the zero state if the pair has never failed.
    pub async fn get_state(
        &self,
        destination_key: &str,
        subscription_url: &str,
    ) -> Result<HealthState, StoreError> {
        let row: Option<HealthRow> = sqlx::query_as(
            r#"
            SELECT destination_key, subscription_url, consecutive_failures, last_error, last_failure_at
            FROM health WHERE destination_key = ? AND subscription_url = ?
            "#,
        )
        .bind(destination_key)
        .bind(subscription_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(HealthState::from)
            .unwrap_or_else(|| HealthState::healthy(destination_key, subscription_url)))
    }

    /// Record a failure and return the updated state.
    pub async fn mark_failure(
        &self,
        destination_key: &str,
        subscription_url: &str,
        message: &str,
    ) -> Result<HealthState, StoreError> {
        self.mark_failure_at(destination_key, subscription_url, message, Utc::now())
            .await
    }

    async fn mark_failure_at(
        &self,
        destination_key: &str,
        subscription_url: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<HealthState, StoreError> {
        let row: HealthRow = sqlx::query_as(
            r#"
            INSERT INTO health (destination_key, subscription_url, consecutive_failures, last_error, last_failure_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT (destination_key, subscription_url) DO UPDATE SET
                consecutive_failures = health.consecutive_failures + 1,
                last_error = excluded.last_error,
                last_failure_at = excluded.last_failure_at
            RETURNING destination_key, subscription_url, consecutive_failures, last_error, last_failure_at
            "#,
        )
        .bind(destination_key)
        .bind(subscription_url)
        .bind(message)
        .bind(to_db_timestamp(at))
        .fetch_one(&self.pool)
        .await?;

        let state = HealthState::from(row);
        tracing::debug!(
            destination = %destination_key,
            subscription = %subscription_url,
            consecutive_failures = state.consecutive_failures,
            "Marked subscription failure"
        );
        Ok(state)
    }

    /// Reset the pair to zero failures and clear the error fields.
    pub async fn mark_success(
        &self,
        destination_key: &str,
        subscription_url: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO health (destination_key, subscription_url, consecutive_failures, last_error, last_failure_at)
            VALUES (?, ?, 0, NULL, NULL)
            ON CONFLICT (destination_key, subscription_url) DO UPDATE SET
                consecutive_failures = 0,
                last_error = NULL,
                last_failure_at = NULL
            "#,
        )
        .bind(destination_key)
        .bind(subscription_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All stored states, most failures first.
    pub async fn list_states(&self) -> Result<Vec<HealthState>, StoreError> {
        let rows: Vec<HealthRow> = sqlx::query_as(
            r#"
            SELECT destination_key, subscription_url, consecutive_failures, last_error, last_failure_at
            FROM health
            ORDER BY consecutive_failures DESC, destination_key, subscription_url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(HealthState::from).collect())
    }
}

/// Alert to send after a failure, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAlert {
    /// First time the failure threshold is reached
    Threshold,
    /// Repeated on every run while the subscription keeps failing
    Escalated,
}

/// Failure thresholds for alerting and selector recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub alert_threshold: u32,
    pub escalation_threshold: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            alert_threshold: 3,
            escalation_threshold: 10,
        }
    }
}

impl RecoveryPolicy {
    pub fn alert_for(&self, consecutive_failures: u32) -> Option<FailureAlert> {
        if consecutive_failures >= self.escalation_threshold {
            Some(FailureAlert::Escalated)
        } else if consecutive_failures == self.alert_threshold {
            Some(FailureAlert::Threshold)
        } else {
            None
        }
    }

    /// Only scraped pages can be recovered, and only once the threshold is reached.
    pub fn should_recover(&self, kind: SubscriptionKind, consecutive_failures: u32) -> bool {
        kind == SubscriptionKind::Css && consecutive_failures >= self.alert_threshold
    }
}
