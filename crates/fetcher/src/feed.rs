use feed_rs::parser;

use watchpost_common::types::FeedItem;

use crate::resolve_link;

/// Parse an RSS/Atom document into candidate items.
///
/// Links are resolved against `page_url`; entries without any link are
/// dropped since they cannot be fingerprinted. The publish time comes from
/// `published`, falling back to `updated`.
pub fn parse_feed(content: &str, page_url: &str) -> Result<Vec<FeedItem>, String> {
    let feed = parser::parse(content.as_bytes()).map_err(|e| format!("Failed to parse feed: {e}"))?;

    let items: Vec<FeedItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let href = entry.links.first()?.href.clone();
            let title = entry
                .title
                .map(|t| t.content.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Untitled".to_string());

            Some(FeedItem {
                title,
                link: resolve_link(&href, page_url),
                published_at: entry.published.or(entry.updated),
            })
        })
        .collect();

    tracing::debug!(page_url, items = items.len(), "Parsed feed");
    Ok(items)
}
