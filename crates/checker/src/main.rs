use std::sync::Arc;
use std::time::Duration;

use watchpost_common::config::AppConfig;
use watchpost_common::config_file::JsonConfigStore;
use watchpost_common::db;
use watchpost_common::traits::SelectorRecovery;
use watchpost_engine::{CheckOptions, CheckOrchestrator, Timeouts};
use watchpost_fetcher::{CommandRecovery, DisabledRecovery, HostRateLimiter, HttpFetcher};
use watchpost_notifier::AppriseTransport;
use watchpost_notifier::format::mask_url;

mod report;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first: it decides the log format
    let config = AppConfig::from_env()?;
    init_tracing(config.json_output);

    tracing::info!(
        db_path = %config.db_path.display(),
        config_path = %config.config_path.display(),
        dry_run = config.dry_run,
        "Watchpost check starting"
    );

    let pool = db::open_store(&config.db_path, config.db_max_connections).await?;
    let store = Arc::new(JsonConfigStore::load(&config.config_path)?);

    let limiter = Arc::new(HostRateLimiter::new(Duration::from_millis(config.rate_limit_ms)));
    let fetcher = Arc::new(HttpFetcher::new(limiter, config.fetch_timeout)?);

    let recovery: Arc<dyn SelectorRecovery> = match config
        .recovery_command
        .as_deref()
        .and_then(CommandRecovery::from_command_line)
    {
        Some(command) => Arc::new(command),
        None => {
            tracing::debug!("No recovery command configured, selector recovery disabled");
            Arc::new(DisabledRecovery)
        }
    };

    if let Some(url) = &config.apprise_url_override {
        tracing::info!(url = %mask_url(url), "Routing every destination to the override address");
    }

    let orchestrator = CheckOrchestrator::new(
        pool.clone(),
        fetcher,
        recovery,
        Arc::new(AppriseTransport::default()),
        store,
    )
    .with_timeouts(Timeouts {
        transport: config.transport_timeout,
        recovery: config.recovery_timeout,
    })
    .with_destination_override(config.apprise_url_override.clone());

    let options = CheckOptions {
        destination_filter: config.destination_filter.clone(),
        concurrency: config.concurrency,
        dry_run: config.dry_run,
    };

    let report = orchestrator.run_check(&options).await?;
    println!(
        "{}",
        report::render_summary(&report.stats, options.dry_run, config.json_output)?
    );

    match orchestrator.health().list_states().await {
        Ok(states) => report::log_failing(&states),
        Err(e) => tracing::warn!(error = %e, "Failed to list subscription health"),
    }

    pool.close().await;

    let code = report.exit_code();
    tracing::info!(exit_code = code, "Watchpost check finished");
    std::process::exit(code);
}

/// Logs go to stderr so stdout carries only the run summary.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "watchpost=info,watchpost_engine=info,watchpost_fetcher=info,watchpost_notifier=info,watchpost_common=info"
            .into()
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
