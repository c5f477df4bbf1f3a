//! Check pipeline: dedup ledger, health tracking, conditional-fetch cache,
//! orchestration and result aggregation.

pub mod aggregator;
pub mod cache;
pub mod health;
pub mod ledger;
pub mod orchestrator;

pub use aggregator::{CheckStats, CheckStatus, ResultAggregator, SentItem, summary_line};
pub use cache::ConditionalCache;
pub use health::{FailureAlert, HealthTracker, RecoveryPolicy};
pub use ledger::{DedupLedger, EvictionReport};
pub use orchestrator::{CheckOptions, CheckOrchestrator, CheckReport, Timeouts};
