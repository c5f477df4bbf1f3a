//! Post-run output: the stdout summary and the health report on stderr.

use watchpost_common::types::HealthState;
use watchpost_engine::{CheckStats, summary_line};

/// Summary printed to stdout. JSON output is the `{sent, skipped, errors}` object.
pub fn render_summary(
    stats: &CheckStats,
    dry_run: bool,
    json: bool,
) -> Result<String, serde_json::Error> {
    if json {
        return serde_json::to_string_pretty(stats);
    }

    let mut lines = vec![summary_line(stats, dry_run)];
    for item in &stats.sent {
        lines.push(format!("  + [{}] {}", item.destination, item.title));
    }
    for error in &stats.errors {
        lines.push(format!("  ! {error}"));
    }
    Ok(lines.join("\n"))
}

/// States with at least one consecutive failure.
pub fn failing(states: &[HealthState]) -> Vec<&HealthState> {
    states
        .iter()
        .filter(|state| state.consecutive_failures > 0)
        .collect()
}

pub fn log_failing(states: &[HealthState]) {
    for state in failing(states) {
        tracing::warn!(
            destination = %state.destination_key,
            subscription = %state.subscription_url,
            consecutive_failures = state.consecutive_failures,
            last_error = state.last_error.as_deref().unwrap_or(""),
            "Subscription is failing"
        );
    }
}
