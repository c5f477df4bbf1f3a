//! Run tallies and the terminal status derived from them.

use serde::Serialize;

use watchpost_common::types::FeedItem;

/// An item delivered (or, in a dry run, that would be delivered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentItem {
    pub title: String,
    pub link: String,
    pub destination: String,
}

impl SentItem {
    pub fn new(item: &FeedItem, destination: &str) -> Self {
        Self {
            title: item.title.clone(),
            link: item.link.clone(),
            destination: destination.to_string(),
        }
    }
}

/// Outcome tallies for one run, or one pair within it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckStats {
    pub sent: Vec<SentItem>,
    pub skipped: u64,
    pub errors: Vec<String>,
}

impl CheckStats {
    pub fn merge(&mut self, other: CheckStats) {
        self.sent.extend(other.sent);
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// Overall outcome, encoded in the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// No errors
    Success,
    /// Errors and nothing sent or skipped
    TotalFailure,
    /// Errors, but some items were sent or skipped
    PartialFailure,
}

impl CheckStatus {
    pub fn from_stats(stats: &CheckStats) -> Self {
        if stats.errors.is_empty() {
            CheckStatus::Success
        } else if stats.sent.is_empty() && stats.skipped == 0 {
            CheckStatus::TotalFailure
        } else {
            CheckStatus::PartialFailure
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            CheckStatus::Success => 0,
            CheckStatus::TotalFailure => 1,
            CheckStatus::PartialFailure => 2,
        }
    }
}

/// Accumulates per-pair stats into the run total.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    stats: CheckStats,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, stats: CheckStats) {
        self.stats.merge(stats);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.stats.errors.push(message.into());
    }

    pub fn status(&self) -> CheckStatus {
        CheckStatus::from_stats(&self.stats)
    }

    pub fn finish(self) -> (CheckStats, CheckStatus) {
        let status = self.status();
        (self.stats, status)
    }
}

/// One-line human summary of a run.
pub fn summary_line(stats: &CheckStats, dry_run: bool) -> String {
    if dry_run {
        return format!("[dry-run] {} items would be sent", stats.sent.len());
    }
    format!(
        "{} new, {} unchanged, {} errors",
        stats.sent.len(),
        stats.skipped,
        stats.errors.len()
    )
}
