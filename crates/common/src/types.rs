use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A notification target.
///
/// `name` is the display identity; its normalized form (see [`Destination::key`])
/// scopes dedup fingerprints and health rows. `url` is the transport routing
/// address and the key deliveries are serialized on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    pub url: String,
}

impl Destination {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Stable key used for dedup and health state.
    pub fn key(&self) -> String {
        normalize_destination_name(&self.name)
    }
}

/// Normalize a destination name for comparison (trimmed, lower-cased).
pub fn normalize_destination_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// CSS selectors used to scrape items from a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CssSelectors {
    /// Selector matching one node per item
    pub item: String,
    /// Selector (relative to the item) for the title node
    pub title: String,
    /// Selector (relative to the item) for the link node
    pub link: String,
}

/// A syndication-feed subscription (RSS / Atom).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSubscription {
    /// Page the feed belongs to; identifies the subscription
    pub url: String,
    /// Feed document URL, also the conditional-cache key
    pub feed_url: String,
}

/// A page scraped with CSS selectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CssSubscription {
    pub url: String,
    pub selectors: CssSelectors,
}

/// One monitored resource attached to a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Subscription {
    Feed(FeedSubscription),
    Css(CssSubscription),
}

impl Subscription {
    /// URL identifying the subscription (health rows, ledger rows, messages).
    pub fn url(&self) -> &str {
        match self {
            Subscription::Feed(feed) => &feed.url,
            Subscription::Css(css) => &css.url,
        }
    }

    pub fn kind(&self) -> SubscriptionKind {
        match self {
            Subscription::Feed(_) => SubscriptionKind::Feed,
            Subscription::Css(_) => SubscriptionKind::Css,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    Feed,
    Css,
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionKind::Feed => write!(f, "feed"),
            SubscriptionKind::Css => write!(f, "css"),
        }
    }
}

/// A candidate item extracted from a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            published_at: None,
        }
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// Freshness tokens for a conditional fetch. Either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheTokens {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Result of one fetch through the content fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub items: Vec<FeedItem>,
    /// The server answered "not modified" for the supplied tokens
    pub not_modified: bool,
    /// Tokens returned by the server, to be stored for the next run
    pub tokens: Option<CacheTokens>,
}

impl FetchOutcome {
    pub fn not_modified() -> Self {
        Self {
            items: Vec::new(),
            not_modified: true,
            tokens: None,
        }
    }

    pub fn items(items: Vec<FeedItem>) -> Self {
        Self {
            items,
            not_modified: false,
            tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: CacheTokens) -> Self {
        if !tokens.is_empty() {
            self.tokens = Some(tokens);
        }
        self
    }
}

/// A delivered item recorded in the dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub hash: String,
    pub destination_key: String,
    pub subscription_url: String,
    pub title: String,
    pub link: String,
    pub sent_at: DateTime<Utc>,
}

/// Consecutive-failure state for one (destination, subscription) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub destination_key: String,
    pub subscription_url: String,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl HealthState {
    /// Zero-failure state for a pair with no stored row.
    pub fn healthy(destination_key: &str, subscription_url: &str) -> Self {
        Self {
            destination_key: destination_key.to_string(),
            subscription_url: subscription_url.to_string(),
            consecutive_failures: 0,
            last_error: None,
            last_failure_at: None,
        }
    }
}

/// Selectors re-derived for a CSS subscription during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorUpdate {
    pub destination_key: String,
    pub subscription_url: String,
    pub selectors: CssSelectors,
}

/// Format a timestamp for storage: fixed-width RFC 3339 in UTC, so that
/// lexical order in SQLite matches chronological order.
pub fn to_db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`to_db_timestamp`].
pub fn from_db_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}
