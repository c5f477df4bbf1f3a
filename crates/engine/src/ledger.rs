//! Dedup ledger: content-addressed record of delivered items.
//!
//! A record is written when an item is handed to the transport and removed
//! again if that delivery fails, so a failed item is retried on the next run
//! while a delivered item is never sent twice to the same destination.
//!
//! Growth is bounded by [`DedupLedger::evict`], run once per check:
//! 1. Delete every record older than the TTL
//! 2. If still above the cap, delete the oldest records down to the cap

use chrono::{DateTime, TimeDelta, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use watchpost_common::error::StoreError;
use watchpost_common::types::{DedupRecord, FeedItem, from_db_timestamp, to_db_timestamp};

/// Rows removed by one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub deleted_by_ttl: u64,
    pub deleted_by_cap: u64,
}

#[derive(sqlx::FromRow)]
struct SentItemRow {
    dedup_hash: String,
    destination_key: String,
    subscription_url: String,
    title: Option<String>,
    link: Option<String>,
    sent_at: String,
}

impl From<SentItemRow> for DedupRecord {
    fn from(row: SentItemRow) -> Self {
        Self {
            hash: row.dedup_hash,
            destination_key: row.destination_key,
            subscription_url: row.subscription_url,
            title: row.title.unwrap_or_default(),
            link: row.link.unwrap_or_default(),
            sent_at: from_db_timestamp(&row.sent_at).unwrap_or(DateTime::UNIX_EPOCH),
        }
    }
}

/// SQLite-backed dedup ledger.
#[derive(Clone)]
pub struct DedupLedger {
    pool: SqlitePool,
}

impl DedupLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// SHA-256 over link, title and destination key, concatenated in that order.
    pub fn fingerprint(destination_key: &str, title: &str, link: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(link.as_bytes());
        hasher.update(title.as_bytes());
        hasher.update(destination_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build the record for delivering `item` to a destination.
    pub fn record_for(
        destination_key: &str,
        subscription_url: &str,
        item: &FeedItem,
        sent_at: DateTime<Utc>,
    ) -> DedupRecord {
        DedupRecord {
            hash: Self::fingerprint(destination_key, &item.title, &item.link),
            destination_key: destination_key.to_string(),
            subscription_url: subscription_url.to_string(),
            title: item.title.clone(),
            link: item.link.clone(),
            sent_at,
        }
    }

    pub async fn exists(&self, hash: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM sent_items WHERE dedup_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert the record unless its hash is already present.
    ///
    /// Returns `false` (not an error) when the hash exists.
    pub async fn insert_if_absent(&self, record: &DedupRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sent_items (dedup_hash, destination_key, subscription_url, title, link, sent_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (dedup_hash) DO NOTHING
            "#,
        )
        .bind(&record.hash)
        .bind(&record.destination_key)
        .bind(&record.subscription_url)
        .bind(&record.title)
        .bind(&record.link)
        .bind(to_db_timestamp(record.sent_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Remove a record. Returns whether a row was deleted.
    pub async fn delete(&self, hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sent_items WHERE dedup_hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, hash: &str) -> Result<Option<DedupRecord>, StoreError> {
        let row: Option<SentItemRow> = sqlx::query_as(
            r#"
            SELECT dedup_hash, destination_key, subscription_url, title, link, sent_at
            FROM sent_items WHERE dedup_hash = ?
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DedupRecord::from))
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sent_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Evict by age, then by count. `None` disables a phase.
    ///
    /// Both phases run in one transaction. The cap phase keeps the
    /// `max_records` most recent rows by `sent_at` (insertion order breaks ties).
    pub async fn evict(
        &self,
        ttl: Option<TimeDelta>,
        max_records: Option<u64>,
    ) -> Result<EvictionReport, StoreError> {
        let mut report = EvictionReport::default();
        let mut tx = self.pool.begin().await?;

        if let Some(ttl) = ttl
            && let Some(cutoff) = Utc::now().checked_sub_signed(ttl)
        {
            report.deleted_by_ttl = sqlx::query("DELETE FROM sent_items WHERE sent_at < ?")
                .bind(to_db_timestamp(cutoff))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        if let Some(max_records) = max_records {
            let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sent_items")
                .fetch_one(&mut *tx)
                .await?;
            let remaining = remaining.max(0) as u64;

            if remaining > max_records {
                let excess = i64::try_from(remaining - max_records).unwrap_or(i64::MAX);
                report.deleted_by_cap = sqlx::query(
                    r#"
                    DELETE FROM sent_items WHERE id IN (
                        SELECT id FROM sent_items ORDER BY sent_at ASC, id ASC LIMIT ?
                    )
                    "#,
                )
                .bind(excess)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }
        }

        tx.commit().await?;

        if report.deleted_by_ttl > 0 || report.deleted_by_cap > 0 {
            tracing::info!(
                deleted_by_ttl = report.deleted_by_ttl,
                deleted_by_cap = report.deleted_by_cap,
                "Evicted dedup records"
            );
        }

        Ok(report)
    }
}
