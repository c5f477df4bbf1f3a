//! Seams to the collaborators the check pipeline drives.
//!
//! The engine only ever talks to these traits; the concrete HTTP fetcher,
//! apprise transport and recovery command live in their own crates and tests
//! substitute in-memory fakes.

use async_trait::async_trait;

use crate::config_file::WatchConfig;
use crate::error::{CheckError, ConfigError};
use crate::types::{CacheTokens, CssSelectors, FetchOutcome, SelectorUpdate, Subscription};

/// Fetches a subscription and extracts its candidate items.
///
/// Implementations must keep the three outcomes apart: an HTTP failure is an
/// `Err`, "not modified" sets [`FetchOutcome::not_modified`], and an empty page
/// is an `Ok` with no items.
///
/// Implementations bound each network request themselves; the orchestrator
/// applies no deadline of its own to a fetch.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(
        &self,
        subscription: &Subscription,
        tokens: Option<&CacheTokens>,
    ) -> Result<FetchOutcome, CheckError>;
}

/// Re-derives CSS selectors for a page whose layout drifted.
#[async_trait]
pub trait SelectorRecovery: Send + Sync {
    async fn recover(&self, url: &str) -> Result<CssSelectors, CheckError>;
}

/// Delivers one notification body to a transport address.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, destination_url: &str, body: &str) -> Result<(), CheckError>;
}

/// Source of the destination/subscription snapshot and sink for recovered selectors.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Configuration as read at run start.
    fn snapshot(&self) -> WatchConfig;

    /// Persist recovered selectors. Called at most once per run.
    async fn persist_selectors(&self, updates: &[SelectorUpdate]) -> Result<(), ConfigError>;
}
