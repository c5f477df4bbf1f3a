//! Content fetching for watchpost subscriptions.
//!
//! [`HttpFetcher`] implements the `ContentFetcher` seam: conditional GETs for
//! feeds, plain GETs plus CSS extraction for scraped pages, retries with
//! exponential backoff and per-host request spacing. [`CommandRecovery`]
//! implements `SelectorRecovery` by shelling out to an external tool.

pub mod css;
pub mod feed;
pub mod http;
pub mod rate_limit;
pub mod recovery;

pub use http::HttpFetcher;
pub use rate_limit::{Clock, HostRateLimiter, SystemClock};
pub use recovery::{CommandRecovery, DisabledRecovery};

use url::Url;

/// Resolve a possibly relative `href` against the page it was found on.
pub(crate) fn resolve_link(href: &str, base: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(href.trim()))
        .map(String::from)
        .unwrap_or_else(|_| href.trim().to_string())
}
