use std::path::PathBuf;
use std::time::Duration;

/// Concurrency used when `CHECK_CONCURRENCY` is unset, non-numeric or not positive.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database file (ledger, health, conditional cache)
    pub db_path: PathBuf,

    /// JSON document holding destinations and subscriptions
    pub config_path: PathBuf,

    /// Transport address used for every destination instead of its own URL
    pub apprise_url_override: Option<String>,

    /// External selector-recovery command; recovery is disabled when unset
    pub recovery_command: Option<String>,

    /// Only check the destination with this name
    pub destination_filter: Option<String>,

    /// Maximum number of subscriptions checked at once (default: 10)
    pub concurrency: usize,

    /// Classify items without sending or recording anything
    pub dry_run: bool,

    /// Print the run summary as JSON
    pub json_output: bool,

    /// Maximum number of SQLite connections in the pool (default: 4)
    pub db_max_connections: u32,

    pub fetch_timeout: Duration,
    pub transport_timeout: Duration,
    pub recovery_timeout: Duration,

    /// Minimum delay between two requests to the same host (default: 1000ms)
    pub rate_limit_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let data_dir = read("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            db_path: read("WATCHPOST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(".local/share/watchpost/watchpost.db")),
            config_path: read("WATCHPOST_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(".config/watchpost/config.json")),
            apprise_url_override: read("WATCHPOST_APPRISE_URL"),
            recovery_command: read("WATCHPOST_RECOVERY_CMD"),
            destination_filter: read("CHECK_DESTINATION"),
            concurrency: parse_concurrency(read("CHECK_CONCURRENCY").as_deref()),
            dry_run: parse_flag(read("CHECK_DRY_RUN").as_deref()),
            json_output: parse_flag(read("CHECK_JSON").as_deref()),
            db_max_connections: read("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|| "4".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            fetch_timeout: Duration::from_secs(parse_secs(read("FETCH_TIMEOUT_SECS"), 30)?),
            transport_timeout: Duration::from_secs(parse_secs(
                read("TRANSPORT_TIMEOUT_SECS"),
                30,
            )?),
            recovery_timeout: Duration::from_secs(parse_secs(read("RECOVERY_TIMEOUT_SECS"), 60)?),
            rate_limit_ms: read("RATE_LIMIT_MS")
                .unwrap_or_else(|| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("RATE_LIMIT_MS must be a valid u64"))?,
        })
    }
}

/// Parse a concurrency value, falling back to [`DEFAULT_CONCURRENCY`] for
/// missing, non-numeric or non-positive input. Fractions are truncated.
pub fn parse_concurrency(raw: Option<&str>) -> usize {
    let Some(raw) = raw else {
        return DEFAULT_CONCURRENCY;
    };
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 1.0 => value.floor() as usize,
        _ => DEFAULT_CONCURRENCY,
    }
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn parse_secs(raw: Option<String>, default: u64) -> anyhow::Result<u64> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("timeout value '{}' must be a whole number of seconds", value)),
    }
}
