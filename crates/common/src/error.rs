use thiserror::Error;

/// Failures of a single (destination, subscription) check.
///
/// Every variant is caught at the orchestrator boundary and turned into a
/// stats entry plus a health update; none of them aborts the run.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("No items matched selector for {url}")]
    Extraction { url: String },

    #[error("Failed to send notification to {destination}: {reason}")]
    Transport { destination: String, reason: String },

    #[error("Selector recovery failed for {url}: {reason}")]
    Recovery { url: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CheckError {
    pub fn fetch(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CheckError::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(destination: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CheckError::Transport {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    pub fn recovery(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CheckError::Recovery {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<sqlx::Error> for CheckError {
    fn from(err: sqlx::Error) -> Self {
        CheckError::Store(StoreError::Database(err))
    }
}

/// Persistent store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to open database at {path}: {reason}")]
    Reset { path: String, reason: String },
}

/// Configuration loading and persistence failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
