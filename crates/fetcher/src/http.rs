use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use reqwest::header::{ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, RequestBuilder, Response, StatusCode};

use watchpost_common::error::CheckError;
use watchpost_common::traits::ContentFetcher;
use watchpost_common::types::{
    CacheTokens, CssSubscription, FeedSubscription, FetchOutcome, Subscription,
};

use crate::css::extract_items;
use crate::feed::parse_feed;
use crate::rate_limit::HostRateLimiter;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";
const PAGE_ACCEPT: &str = "text/html, application/xhtml+xml;q=0.9, */*;q=0.5";

/// HTTP implementation of [`ContentFetcher`].
///
/// `request_timeout` bounds each attempt from the moment it is sent until its
/// body has been read. Waiting for a rate-limiter slot and backoff sleeps are
/// not part of it.
pub struct HttpFetcher {
    client: Client,
    limiter: Arc<HostRateLimiter>,
    request_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(
        limiter: Arc<HostRateLimiter>,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("watchpost/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            limiter,
            request_timeout,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Override the retry budget and the first backoff interval.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    async fn fetch_feed(
        &self,
        feed: &FeedSubscription,
        tokens: Option<&CacheTokens>,
    ) -> Result<FetchOutcome, CheckError> {
        let response = self
            .get_with_retry(&feed.feed_url, |client| {
                let mut request = client.get(&feed.feed_url).header(ACCEPT, FEED_ACCEPT);
                if let Some(tokens) = tokens {
                    if let Some(etag) = &tokens.etag {
                        request = request.header(IF_NONE_MATCH, etag);
                    }
                    if let Some(last_modified) = &tokens.last_modified {
                        request = request.header(IF_MODIFIED_SINCE, last_modified);
                    }
                }
                request
            })
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            tracing::debug!(feed_url = %feed.feed_url, "Feed not modified");
            return Ok(FetchOutcome::not_modified());
        }

        let fresh = CacheTokens {
            etag: header_value(&response, ETAG),
            last_modified: header_value(&response, LAST_MODIFIED),
        };

        let body = response
            .text()
            .await
            .map_err(|e| CheckError::fetch(&feed.feed_url, self.describe(&e)))?;
        let items = parse_feed(&body, &feed.url).map_err(|e| CheckError::fetch(&feed.feed_url, e))?;

        Ok(FetchOutcome::items(items).with_tokens(fresh))
    }

    async fn fetch_page(&self, css: &CssSubscription) -> Result<FetchOutcome, CheckError> {
        let response = self
            .get_with_retry(&css.url, |client| {
                client.get(&css.url).header(ACCEPT, PAGE_ACCEPT)
            })
            .await?;

        let html = response
            .text()
            .await
            .map_err(|e| CheckError::fetch(&css.url, self.describe(&e)))?;

        let items = extract_items(&html, &css.url, &css.selectors).map_err(|reason| {
            tracing::warn!(url = %css.url, reason = %reason, "Selector extraction failed");
            CheckError::Extraction {
                url: css.url.clone(),
            }
        })?;

        Ok(FetchOutcome::items(items))
    }

    /// Send a request, retrying transient failures with exponential backoff.
    ///
    /// Returns the first non-retryable response. Statuses of 400 and above
    /// that are not retryable, and exhausted retries, become fetch errors.
    async fn get_with_retry<F>(&self, url: &str, build: F) -> Result<Response, CheckError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: self.retry_delay,
            initial_interval: self.retry_delay,
            max_interval: self.retry_delay * 8,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            self.limiter.wait(url).await;

            let failure = match build(&self.client).send().await {
                Ok(response) if is_retryable_status(response.status()) => {
                    format!("HTTP {}", response.status())
                }
                Ok(response) if response.status().as_u16() >= 400 => {
                    return Err(CheckError::fetch(url, format!("HTTP {}", response.status())));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() || e.is_connect() => self.describe(&e),
                Err(e) => return Err(CheckError::fetch(url, self.describe(&e))),
            };

            attempt += 1;
            if attempt > self.max_retries {
                return Err(CheckError::fetch(url, failure));
            }

            let delay = backoff.next_backoff().unwrap_or(self.retry_delay);
            tracing::warn!(
                url,
                attempt,
                reason = %failure,
                delay_ms = delay.as_millis() as u64,
                "Request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn describe(&self, error: &reqwest::Error) -> String {
        if error.is_timeout() {
            format!("timed out after {:?}", self.request_timeout)
        } else {
            error.to_string()
        }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(
        &self,
        subscription: &Subscription,
        tokens: Option<&CacheTokens>,
    ) -> Result<FetchOutcome, CheckError> {
        match subscription {
            Subscription::Feed(feed) => self.fetch_feed(feed, tokens).await,
            Subscription::Css(css) => self.fetch_page(css).await,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

fn header_value(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
