//! Conditional-fetch tokens per feed URL, stored in the `meta` key/value table
//! under `etag:<url>` and `last-modified:<url>`.

use sqlx::SqlitePool;

use watchpost_common::error::StoreError;
use watchpost_common::types::CacheTokens;

fn etag_key(feed_url: &str) -> String {
    format!("etag:{feed_url}")
}

fn last_modified_key(feed_url: &str) -> String {
    format!("last-modified:{feed_url}")
}

#[derive(Clone)]
pub struct ConditionalCache {
    pool: SqlitePool,
}

impl ConditionalCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stored tokens, or `None` when neither is known.
    pub async fn get_tokens(&self, feed_url: &str) -> Result<Option<CacheTokens>, StoreError> {
        let tokens = CacheTokens {
            etag: self.get_value(&etag_key(feed_url)).await?,
            last_modified: self.get_value(&last_modified_key(feed_url)).await?,
        };
        Ok((!tokens.is_empty()).then_some(tokens))
    }

    /// Upsert the tokens that are present. An absent field keeps its stored value.
    pub async fn set_tokens(&self, feed_url: &str, tokens: &CacheTokens) -> Result<(), StoreError> {
        let entries = [
            (etag_key(feed_url), tokens.etag.as_deref()),
            (last_modified_key(feed_url), tokens.last_modified.as_deref()),
        ];

        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            let Some(value) = value else { continue };
            sqlx::query(
                "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .bind(&key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(feed_url, "Stored conditional fetch tokens");
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchpost_common::db::open_in_memory;

    const FEED: &str = "https://blog.example/rss.xml";

    async fn cache() -> ConditionalCache {
        ConditionalCache::new(open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_unknown_feed_has_no_tokens() {
        assert_eq!(cache().await.get_tokens(FEED).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_get_tokens() {
        let cache = cache().await;
        let tokens = CacheTokens {
            etag: Some("\"abc\"".to_string()),
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
        };

        cache.set_tokens(FEED, &tokens).await.unwrap();
        assert_eq!(cache.get_tokens(FEED).await.unwrap(), Some(tokens));
        assert_eq!(cache.get_tokens("https://other.example/feed").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fields_are_independent() {
        let cache = cache().await;
        cache
            .set_tokens(FEED, &CacheTokens {
                etag: Some("v1".to_string()),
                last_modified: None,
            })
            .await
            .unwrap();
        assert_eq!(
            cache.get_tokens(FEED).await.unwrap(),
            Some(CacheTokens {
                etag: Some("v1".to_string()),
                last_modified: None,
            })
        );

        cache
            .set_tokens(FEED, &CacheTokens {
                etag: Some("v2".to_string()),
                last_modified: Some("Thu, 01 Jan 2026 00:00:00 GMT".to_string()),
            })
            .await
            .unwrap();
        cache
            .set_tokens(FEED, &CacheTokens {
                etag: None,
                last_modified: Some("Fri, 02 Jan 2026 00:00:00 GMT".to_string()),
            })
            .await
            .unwrap();

        let stored = cache.get_tokens(FEED).await.unwrap().unwrap();
        assert_eq!(stored.etag.as_deref(), Some("v2"));
        assert_eq!(stored.last_modified.as_deref(), Some("Fri, 02 Jan 2026 00:00:00 GMT"));
    }
}
