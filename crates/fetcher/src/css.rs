use scraper::{ElementRef, Html, Selector};

use watchpost_common::types::{CssSelectors, FeedItem};

use crate::resolve_link;

/// Extract items from an HTML page with the subscription's selectors.
///
/// For each node matching the item selector: the title is the text of the
/// first title match (falling back to the link text, then "Untitled"); the
/// link is the `href` of the first link match (falling back to the title
/// node's `href`, then the page itself), resolved against `page_url`.
pub fn extract_items(
    html: &str,
    page_url: &str,
    selectors: &CssSelectors,
) -> Result<Vec<FeedItem>, String> {
    let item_selector = parse_selector(&selectors.item)?;
    let title_selector = parse_selector(&selectors.title)?;
    let link_selector = parse_selector(&selectors.link)?;

    let document = Html::parse_document(html);
    let items = document
        .select(&item_selector)
        .map(|node| {
            let title_node = node.select(&title_selector).next();
            let link_node = node.select(&link_selector).next();

            let title = [title_node, link_node]
                .into_iter()
                .flatten()
                .map(text_of)
                .find(|text| !text.is_empty())
                .unwrap_or_else(|| "Untitled".to_string());

            let href = link_node
                .and_then(|n| n.value().attr("href"))
                .or_else(|| title_node.and_then(|n| n.value().attr("href")))
                .unwrap_or(page_url);

            FeedItem::new(title, resolve_link(href, page_url))
        })
        .collect();

    Ok(items)
}

/// Check that a selector is syntactically valid.
pub fn validate_selector(raw: &str) -> Result<(), String> {
    parse_selector(raw).map(|_| ())
}

fn parse_selector(raw: &str) -> Result<Selector, String> {
    Selector::parse(raw).map_err(|e| format!("invalid selector '{raw}': {e:?}"))
}

fn text_of(node: ElementRef<'_>) -> String {
    node.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<html><body>
  <article class="post"><h2><a href="/news/1">  First   story </a></h2></article>
  <article class="post"><h2>Second story</h2><a class="more" href="https://other.example/2">read</a></article>
  <article class="post"><span>no title or link here</span></article>
</body></html>"#;

    fn selectors(link: &str) -> CssSelectors {
        CssSelectors {
            item: "article.post".to_string(),
            title: "h2".to_string(),
            link: link.to_string(),
        }
    }

    #[test]
    fn test_extracts_titles_and_links() {
        let items = extract_items(PAGE, "https://news.example/latest", &selectors("a")).unwrap();
        assert_eq!(items.len(), 3);

        assert_eq!(items[0].title, "First story");
        assert_eq!(items[0].link, "https://news.example/news/1");

        assert_eq!(items[1].title, "Second story");
        assert_eq!(items[1].link, "https://other.example/2");

        assert_eq!(items[2].title, "Untitled");
        assert_eq!(items[2].link, "https://news.example/latest");
        assert!(items.iter().all(|item| item.published_at.is_none()));
    }

    #[test]
    fn test_no_matches_is_empty_not_error() {
        let items = extract_items(PAGE, "https://news.example", &CssSelectors {
            item: "li.missing".to_string(),
            title: "h2".to_string(),
            link: "a".to_string(),
        })
        .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_invalid_selector_is_error() {
        assert!(extract_items(PAGE, "https://news.example", &selectors("a[")).is_err());
        assert!(validate_selector("div > a").is_ok());
        assert!(validate_selector(">>>").is_err());
    }
}
