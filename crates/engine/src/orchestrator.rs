//! Check orchestration: one pass over every (destination, subscription) pair.
//!
//! A run:
//! 1. Evicts stale dedup records (skipped in a dry run)
//! 2. Checks every pair on a worker pool capped at `concurrency` pairs in flight
//! 3. Per pair: fetch (with cached tokens for feeds), dedup each item oldest
//!    first, hand new items to the per-destination serializer, roll back the
//!    dedup record of any failed delivery, then update health
//! 4. On failure: mark the pair failed, try selector recovery for scraped
//!    pages past the threshold, and send threshold/escalation alerts
//! 5. Persists recovered selectors once, after every pair has finished
//!
//! A dry run reads the ledger and cache but writes nothing and sends nothing.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use watchpost_common::config::DEFAULT_CONCURRENCY;
use watchpost_common::error::CheckError;
use watchpost_common::traits::{
    ConfigStore, ContentFetcher, NotificationTransport, SelectorRecovery,
};
use watchpost_common::types::{
    CssSelectors, Destination, FeedItem, SelectorUpdate, Subscription, normalize_destination_name,
};
use watchpost_notifier::NotificationSerializer;
use watchpost_notifier::format::{escalated_alert_body, failure_alert_body, format_body, mask_url};

use crate::aggregator::{CheckStats, CheckStatus, ResultAggregator, SentItem};
use crate::cache::ConditionalCache;
use crate::health::{FailureAlert, HealthTracker, RecoveryPolicy};
use crate::ledger::{DedupLedger, EvictionReport};

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Only check the destination with this (normalized) name
    pub destination_filter: Option<String>,
    /// Maximum pairs checked at once; values below 1 are treated as 1
    pub concurrency: usize,
    pub dry_run: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            destination_filter: None,
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
        }
    }
}

/// Bounds on each delivery and recovery call. Expiry is an ordinary pair failure.
///
/// Fetches are bounded per request by the [`ContentFetcher`] itself, so that
/// time spent queued behind the per-host rate limiter or sleeping between
/// retries never counts against a subscription.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub transport: Duration,
    pub recovery: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            transport: Duration::from_secs(30),
            recovery: Duration::from_secs(60),
        }
    }
}

/// Result of [`CheckOrchestrator::run_check`].
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub stats: CheckStats,
    pub status: CheckStatus,
    /// `None` in a dry run
    pub eviction: Option<EvictionReport>,
    pub recovered: Vec<SelectorUpdate>,
}

impl CheckReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// What one pair contributes to the run.
#[derive(Debug, Default)]
struct PairReport {
    stats: CheckStats,
    selector_update: Option<SelectorUpdate>,
}

/// A pair scheduled for checking.
struct PairJob {
    destination: Destination,
    /// Transport address deliveries are routed to and serialized on
    route: String,
    subscription: Subscription,
}

#[derive(Clone)]
pub struct CheckOrchestrator {
    ledger: DedupLedger,
    health: HealthTracker,
    cache: ConditionalCache,
    fetcher: Arc<dyn ContentFetcher>,
    recovery: Arc<dyn SelectorRecovery>,
    transport: Arc<dyn NotificationTransport>,
    config_store: Arc<dyn ConfigStore>,
    serializer: Arc<NotificationSerializer>,
    policy: RecoveryPolicy,
    timeouts: Timeouts,
    destination_override: Option<String>,
}

impl CheckOrchestrator {
    pub fn new(
        pool: SqlitePool,
        fetcher: Arc<dyn ContentFetcher>,
        recovery: Arc<dyn SelectorRecovery>,
        transport: Arc<dyn NotificationTransport>,
        config_store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            ledger: DedupLedger::new(pool.clone()),
            health: HealthTracker::new(pool.clone()),
            cache: ConditionalCache::new(pool),
            fetcher,
            recovery,
            transport,
            config_store,
            serializer: Arc::new(NotificationSerializer::new()),
            policy: RecoveryPolicy::default(),
            timeouts: Timeouts::default(),
            destination_override: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Route every destination's deliveries to `url` instead of its own address.
    pub fn with_destination_override(mut self, url: Option<String>) -> Self {
        self.destination_override = url;
        self
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn cache(&self) -> &ConditionalCache {
        &self.cache
    }

    /// Run one check pass.
    ///
    /// Per-pair failures end up in the returned stats; only a failure of the
    /// eviction step, which means the store itself is unusable, is returned
    /// as an error.
    pub async fn run_check(&self, options: &CheckOptions) -> Result<CheckReport, CheckError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("check", run_id = %run_id, dry_run = options.dry_run);
        self.run_check_inner(options).instrument(span).await
    }

    async fn run_check_inner(&self, options: &CheckOptions) -> Result<CheckReport, CheckError> {
        let config = self.config_store.snapshot();

        let eviction = if options.dry_run {
            None
        } else {
            Some(
                self.ledger
                    .evict(Some(config.cleanup.ttl()), Some(config.cleanup.max_records))
                    .await?,
            )
        };

        let filter = options
            .destination_filter
            .as_deref()
            .map(normalize_destination_name);

        let jobs: Vec<PairJob> = config
            .destinations
            .iter()
            .filter(|d| {
                filter
                    .as_deref()
                    .is_none_or(|wanted| normalize_destination_name(&d.name) == wanted)
            })
            .flat_map(|d| {
                let destination = d.destination();
                let route = self
                    .destination_override
                    .clone()
                    .unwrap_or_else(|| d.url.clone());
                d.subscriptions.iter().map(move |subscription| PairJob {
                    destination: destination.clone(),
                    route: route.clone(),
                    subscription: subscription.clone(),
                })
            })
            .collect();

        if let Some(wanted) = &filter
            && jobs.is_empty()
        {
            tracing::warn!(destination = %wanted, "No subscriptions match the destination filter");
        }

        tracing::info!(
            pairs = jobs.len(),
            concurrency = options.concurrency.max(1),
            "Starting check"
        );

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for job in jobs {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let dry_run = options.dry_run;
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    this.check_pair(&job, dry_run).await
                }
                .in_current_span(),
            );
        }

        let mut aggregator = ResultAggregator::new();
        let mut recovered = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    aggregator.absorb(report.stats);
                    recovered.extend(report.selector_update);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Check task failed");
                    aggregator.record_error(format!("check task failed: {e}"));
                }
            }
        }

        if !recovered.is_empty() {
            match self.config_store.persist_selectors(&recovered).await {
                Ok(()) => tracing::info!(updated = recovered.len(), "Persisted recovered selectors"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to persist recovered selectors");
                    aggregator.record_error(format!("Failed to persist recovered selectors: {e}"));
                }
            }
        }

        let (stats, status) = aggregator.finish();
        tracing::info!(
            sent = stats.sent.len(),
            skipped = stats.skipped,
            errors = stats.errors.len(),
            exit_code = status.exit_code(),
            "Check complete"
        );

        Ok(CheckReport {
            stats,
            status,
            eviction,
            recovered,
        })
    }

    async fn check_pair(&self, job: &PairJob, dry_run: bool) -> PairReport {
        let mut report = PairReport::default();
        let key = job.destination.key();
        let url = job.subscription.url();

        match self.process_pair(job, dry_run, &mut report.stats).await {
            Ok(()) => {
                if !dry_run && let Err(e) = self.health.mark_success(&key, url).await {
                    tracing::error!(subscription = %url, error = %e, "Failed to record success");
                    report.stats.errors.push(format!("{url}: {e}"));
                }
            }
            Err(err) => self.handle_failure(job, err, dry_run, &mut report).await,
        }

        report
    }

    /// Fetch, dedup and deliver. Any returned error is a pair failure.
    async fn process_pair(
        &self,
        job: &PairJob,
        dry_run: bool,
        stats: &mut CheckStats,
    ) -> Result<(), CheckError> {
        let url = job.subscription.url();
        let key = job.destination.key();

        let tokens = match &job.subscription {
            Subscription::Feed(feed) => self.cache.get_tokens(&feed.feed_url).await?,
            Subscription::Css(_) => None,
        };

        let outcome = self
            .fetcher
            .fetch(&job.subscription, tokens.as_ref())
            .await?;

        if outcome.not_modified {
            tracing::debug!(subscription = %url, "Not modified");
            return Ok(());
        }

        if outcome.items.is_empty() && matches!(job.subscription, Subscription::Css(_)) {
            return Err(CheckError::Extraction {
                url: url.to_string(),
            });
        }

        let mut items = outcome.items;
        sort_oldest_first(&mut items);

        let mut pending = Vec::new();
        let mut store_error: Option<CheckError> = None;
        for item in items {
            let record = DedupLedger::record_for(&key, url, &item, Utc::now());

            if dry_run {
                match self.ledger.exists(&record.hash).await {
                    Ok(true) => stats.skipped += 1,
                    Ok(false) => {
                        tracing::info!(
                            title = %item.title,
                            destination = %job.destination,
                            "Would send"
                        );
                        stats.sent.push(SentItem::new(&item, &job.destination.name));
                    }
                    Err(e) => {
                        store_error = Some(e.into());
                        break;
                    }
                }
                continue;
            }

            match self.ledger.insert_if_absent(&record).await {
                Ok(false) => {
                    tracing::debug!(title = %item.title, "Already sent, skipping");
                    stats.skipped += 1;
                }
                Ok(true) => {
                    let completion = self.deliver(&job.route, format_body(&item.link, &item.title));
                    pending.push((record.hash, item, completion));
                }
                Err(e) => {
                    store_error = Some(e.into());
                    break;
                }
            }
        }

        // Every queued delivery is awaited, even after a store error, so that
        // failed ones are rolled back.
        let mut delivery_error = None;
        for (hash, item, completion) in pending {
            match completion.await {
                Ok(()) => {
                    tracing::info!(
                        title = %item.title,
                        destination = %job.destination,
                        "Sent notification"
                    );
                    stats.sent.push(SentItem::new(&item, &job.destination.name));
                }
                Err(err) => {
                    tracing::warn!(
                        title = %item.title,
                        destination = %job.destination,
                        error = %err,
                        "Delivery failed, rolling back dedup record"
                    );
                    if let Err(e) = self.ledger.delete(&hash).await {
                        tracing::error!(hash = %hash, error = %e, "Failed to roll back dedup record");
                    }
                    delivery_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = store_error.or(delivery_error) {
            return Err(err);
        }

        // Stored only once everything was delivered, so a failed delivery is
        // retried against a full fetch rather than a "not modified".
        if !dry_run
            && let Subscription::Feed(feed) = &job.subscription
            && let Some(fresh) = &outcome.tokens
        {
            self.cache.set_tokens(&feed.feed_url, fresh).await?;
        }

        Ok(())
    }

    async fn handle_failure(
        &self,
        job: &PairJob,
        err: CheckError,
        dry_run: bool,
        report: &mut PairReport,
    ) {
        let url = job.subscription.url();
        let key = job.destination.key();
        let message = err.to_string();
        report.stats.errors.push(format!("{url}: {message}"));

        if dry_run {
            tracing::warn!(subscription = %url, error = %message, "Subscription check failed");
            return;
        }

        let state = match self.health.mark_failure(&key, url, &message).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(subscription = %url, error = %e, "Failed to record failure");
                report.stats.errors.push(format!("{url}: {e}"));
                return;
            }
        };

        tracing::warn!(
            destination = %job.destination,
            subscription = %url,
            consecutive_failures = state.consecutive_failures,
            error = %message,
            "Subscription check failed"
        );

        if self
            .policy
            .should_recover(job.subscription.kind(), state.consecutive_failures)
        {
            match self.recover(url).await {
                Ok(selectors) => {
                    tracing::info!(subscription = %url, "Recovered selectors");
                    if let Err(e) = self.health.mark_success(&key, url).await {
                        tracing::error!(subscription = %url, error = %e, "Failed to record success");
                    }
                    report.selector_update = Some(SelectorUpdate {
                        destination_key: key.clone(),
                        subscription_url: url.to_string(),
                        selectors,
                    });
                }
                Err(e) => {
                    tracing::warn!(subscription = %url, error = %e, "Selector recovery failed");
                    report.stats.errors.push(e.to_string());
                }
            }
        }

        if let Some(alert) = self.policy.alert_for(state.consecutive_failures) {
            let body = match alert {
                FailureAlert::Threshold => {
                    failure_alert_body(url, state.consecutive_failures, &message)
                }
                FailureAlert::Escalated => {
                    escalated_alert_body(url, &job.destination.name, state.consecutive_failures)
                }
            };
            if let Err(e) = self.deliver(&job.route, body).await {
                tracing::warn!(subscription = %url, error = %e, "Failure alert not delivered");
            }
        }
    }

    async fn recover(&self, url: &str) -> Result<CssSelectors, CheckError> {
        tokio::time::timeout(self.timeouts.recovery, self.recovery.recover(url))
            .await
            .map_err(|_| {
                CheckError::recovery(
                    url,
                    format!("timed out after {:?}", self.timeouts.recovery),
                )
            })?
    }

    /// Queue a send on the route's serializer. The transport timeout covers
    /// only the send itself, not time spent waiting in the queue.
    fn deliver(
        &self,
        route: &str,
        body: String,
    ) -> impl Future<Output = Result<(), CheckError>> + Send + 'static {
        let transport = self.transport.clone();
        let limit = self.timeouts.transport;
        let address = route.to_string();

        self.serializer.enqueue(route, async move {
            tokio::time::timeout(limit, transport.send(&address, &body))
                .await
                .unwrap_or_else(|_| {
                    Err(CheckError::transport(
                        mask_url(&address),
                        format!("timed out after {limit:?}"),
                    ))
                })
        })
    }
}

/// Oldest publish time first; undated items keep their order at the end.
fn sort_oldest_first(items: &mut [FeedItem]) {
    items.sort_by(|a, b| match (a.published_at, b.published_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
