//! Integration tests for the HTTP fetcher against a local canned-response server.
//!
//! ```bash
//! cargo test -p watchpost-fetcher --test integration
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use watchpost_common::error::CheckError;
use watchpost_common::traits::ContentFetcher;
use watchpost_common::types::{
    CacheTokens, CssSelectors, CssSubscription, FeedSubscription, Subscription,
};
use watchpost_fetcher::{HostRateLimiter, HttpFetcher};

// ============================================================
// Shared helpers
// ============================================================

const FEED: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>t</title><link>http://example.test</link>
<item><title>Hello</title><link>/hello</link><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;

struct CannedResponse {
    status: &'static str,
    headers: Vec<(&'static str, &'static str)>,
    body: &'static str,
}

impl CannedResponse {
    fn ok(body: &'static str) -> Self {
        Self {
            status: "200 OK",
            headers: Vec::new(),
            body,
        }
    }

    fn status(status: &'static str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: "",
        }
    }

    fn header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }

    fn render(&self) -> String {
        let mut out = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.body.len(),
            self.body
        ));
        out
    }
}

/// Serve one canned response per connection, in order, recording the raw
/// request heads. The last response repeats once the list is exhausted.
async fn serve(responses: Vec<CannedResponse>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let seen = requests.clone();
    tokio::spawn(async move {
        let mut index = 0;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };

            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            seen.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&head).to_lowercase());

            let response = &responses[index.min(responses.len() - 1)];
            index += 1;
            let _ = socket.write_all(response.render().as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), requests)
}

fn fetcher() -> HttpFetcher {
    let limiter = Arc::new(HostRateLimiter::new(Duration::ZERO));
    HttpFetcher::new(limiter, Duration::from_secs(5))
        .unwrap()
        .with_retries(2, Duration::from_millis(1))
}

fn feed_subscription(base: &str) -> Subscription {
    Subscription::Feed(FeedSubscription {
        url: format!("{base}/"),
        feed_url: format!("{base}/feed.xml"),
    })
}

// ============================================================
// Feed fetching
// ============================================================

#[tokio::test]
async fn test_feed_fetch_returns_items_and_tokens() {
    let (base, requests) = serve(vec![
        CannedResponse::ok(FEED)
            .header("ETag", "\"v1\"")
            .header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
    ])
    .await;

    let outcome = fetcher().fetch(&feed_subscription(&base), None).await.unwrap();

    assert!(!outcome.not_modified);
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].title, "Hello");
    assert_eq!(outcome.items[0].link, format!("{base}/hello"));

    let tokens = outcome.tokens.unwrap();
    assert_eq!(tokens.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        tokens.last_modified.as_deref(),
        Some("Mon, 01 Jan 2024 00:00:00 GMT")
    );

    let requests = requests.lock().unwrap();
    assert!(requests[0].starts_with("get /feed.xml"));
    assert!(!requests[0].contains("if-none-match"));
}

#[tokio::test]
async fn test_feed_not_modified_sends_conditional_headers() {
    let (base, requests) = serve(vec![CannedResponse::status("304 Not Modified")]).await;

    let tokens = CacheTokens {
        etag: Some("\"v1\"".to_string()),
        last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
    };
    let outcome = fetcher()
        .fetch(&feed_subscription(&base), Some(&tokens))
        .await
        .unwrap();

    assert!(outcome.not_modified);
    assert!(outcome.items.is_empty());
    assert!(outcome.tokens.is_none());

    let requests = requests.lock().unwrap();
    assert!(requests[0].contains("if-none-match: \"v1\""));
    assert!(requests[0].contains("if-modified-since: mon, 01 jan 2024 00:00:00 gmt"));
}

// ============================================================
// Retry behavior
// ============================================================

#[tokio::test]
async fn test_transient_status_is_retried() {
    let (base, requests) = serve(vec![
        CannedResponse::status("503 Service Unavailable"),
        CannedResponse::ok(FEED),
    ])
    .await;

    let outcome = fetcher().fetch(&feed_subscription(&base), None).await.unwrap();
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(requests.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let (base, requests) = serve(vec![CannedResponse::status("500 Internal Server Error")]).await;

    let err = fetcher()
        .fetch(&feed_subscription(&base), None)
        .await
        .unwrap_err();

    assert!(matches!(err, CheckError::Fetch { .. }));
    assert!(err.to_string().contains("500"));
    // One initial attempt plus two retries
    assert_eq!(requests.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (base, requests) = serve(vec![CannedResponse::status("404 Not Found")]).await;

    let err = fetcher()
        .fetch(&feed_subscription(&base), None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("404"));
    assert_eq!(requests.lock().unwrap().len(), 1);
}

// ============================================================
// CSS pages
// ============================================================

#[tokio::test]
async fn test_css_page_extraction() {
    let (base, _requests) = serve(vec![CannedResponse::ok(
        r#"<html><body>
            <div class="entry"><a href="/one">One</a></div>
            <div class="entry"><a href="/two">Two</a></div>
        </body></html>"#,
    )])
    .await;

    let subscription = Subscription::Css(CssSubscription {
        url: format!("{base}/news"),
        selectors: CssSelectors {
            item: "div.entry".to_string(),
            title: "a".to_string(),
            link: "a".to_string(),
        },
    });

    let outcome = fetcher().fetch(&subscription, None).await.unwrap();
    assert!(outcome.tokens.is_none());

    let links: Vec<_> = outcome.items.iter().map(|i| i.link.as_str()).collect();
    assert_eq!(links, vec![format!("{base}/one"), format!("{base}/two")]);
    assert_eq!(outcome.items[1].title, "Two");
}

#[tokio::test]
async fn test_css_page_without_matches_is_empty() {
    let (base, _requests) = serve(vec![CannedResponse::ok("<html><body></body></html>")]).await;

    let subscription = Subscription::Css(CssSubscription {
        url: format!("{base}/news"),
        selectors: CssSelectors {
            item: "div.entry".to_string(),
            title: "a".to_string(),
            link: "a".to_string(),
        },
    });

    let outcome = fetcher().fetch(&subscription, None).await.unwrap();
    assert!(outcome.items.is_empty());
    assert!(!outcome.not_modified);
}

// ============================================================
// Timeouts and rate limiting
// ============================================================

#[tokio::test]
async fn test_rate_limit_wait_does_not_count_against_request_timeout() {
    let (base, requests) = serve(vec![CannedResponse::ok(FEED)]).await;
    let limiter = Arc::new(HostRateLimiter::new(Duration::from_millis(150)));
    let fetcher = Arc::new(HttpFetcher::new(limiter, Duration::from_millis(300)).unwrap());

    let started = std::time::Instant::now();
    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..6 {
        let fetcher = fetcher.clone();
        let subscription = Subscription::Feed(FeedSubscription {
            url: format!("{base}/p{n}/"),
            feed_url: format!("{base}/p{n}/feed.xml"),
        });
        tasks.spawn(async move { fetcher.fetch(&subscription, None).await });
    }

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap().unwrap();
        assert_eq!(outcome.items.len(), 1);
    }

    // The last request waited five slots, well past the per-request timeout
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert_eq!(requests.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn test_request_timeout_is_reported_with_duration() {
    // Accepts connections and never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let limiter = Arc::new(HostRateLimiter::new(Duration::ZERO));
    let fetcher = HttpFetcher::new(limiter, Duration::from_millis(200))
        .unwrap()
        .with_retries(0, Duration::from_millis(1));

    let err = fetcher
        .fetch(&feed_subscription(&format!("http://{addr}")), None)
        .await
        .unwrap_err();

    assert!(matches!(err, CheckError::Fetch { .. }));
    assert!(err.to_string().contains("timed out after 200ms"), "{err}");
}
