//! JSON subscription configuration.
//!
//! ```json
//! {
//!   "cleanup": { "ttl_days": 90, "max_records": 50000 },
//!   "destinations": [
//!     {
//!       "name": "main",
//!       "url": "slack://token/channel",
//!       "subscriptions": [
//!         { "kind": "feed", "url": "https://blog.example", "feed_url": "https://blog.example/rss.xml" },
//!         { "kind": "css", "url": "https://news.example", "selectors": { "item": "article", "title": "h2", "link": "a" } }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::traits::ConfigStore;
use crate::types::{Destination, SelectorUpdate, Subscription, normalize_destination_name};

const DEFAULT_TTL_DAYS: u32 = 90;
const DEFAULT_MAX_RECORDS: u64 = 50_000;

/// Dedup ledger retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    #[serde(default = "default_max_records")]
    pub max_records: u64,
}

fn default_ttl_days() -> u32 {
    DEFAULT_TTL_DAYS
}

fn default_max_records() -> u64 {
    DEFAULT_MAX_RECORDS
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            ttl_days: DEFAULT_TTL_DAYS,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

impl CleanupConfig {
    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.ttl_days))
    }
}

/// A destination together with its subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

impl DestinationConfig {
    pub fn destination(&self) -> Destination {
        Destination::new(self.name.clone(), self.url.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

impl WatchConfig {
    /// Reject values the pipeline cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup.ttl_days == 0 || self.cleanup.max_records == 0 {
            return Err(ConfigError::Invalid(
                "cleanup.ttl_days and cleanup.max_records must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for destination in &self.destinations {
            let key = normalize_destination_name(&destination.name);
            if key.is_empty() {
                return Err(ConfigError::Invalid("destination name must not be empty".to_string()));
            }
            if !seen.insert(key) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate destination name '{}'",
                    destination.name
                )));
            }

            let mut urls = std::collections::HashSet::new();
            for subscription in &destination.subscriptions {
                if !urls.insert(subscription.url()) {
                    return Err(ConfigError::Invalid(format!(
                        "destination '{}' lists subscription {} more than once",
                        destination.name,
                        subscription.url()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Write recovered selectors into the matching CSS subscriptions.
    ///
    /// Returns how many subscriptions were updated; updates whose target no
    /// longer exists (or is not a CSS subscription) are skipped.
    pub fn apply_selector_updates(&mut self, updates: &[SelectorUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            let target = self
                .destinations
                .iter_mut()
                .filter(|d| normalize_destination_name(&d.name) == update.destination_key)
                .flat_map(|d| d.subscriptions.iter_mut())
                .find(|s| s.url() == update.subscription_url);

            if let Some(Subscription::Css(css)) = target {
                css.selectors = update.selectors.clone();
                applied += 1;
            }
        }
        applied
    }
}

/// File-backed [`ConfigStore`].
pub struct JsonConfigStore {
    path: PathBuf,
    current: Mutex<WatchConfig>,
}

impl JsonConfigStore {
    /// Read the configuration file. A missing file yields an empty configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str::<WatchConfig>(&text).map_err(|source| {
                ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, starting empty");
                WatchConfig::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        config.validate()?;

        Ok(Self {
            path: path.to_path_buf(),
            current: Mutex::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, config: &WatchConfig) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        };

        let text = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // Write next to the target and rename so readers never see a partial file.
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, format!("{text}\n"))
            .await
            .map_err(io_err)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    fn snapshot(&self) -> WatchConfig {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn persist_selectors(&self, updates: &[SelectorUpdate]) -> Result<(), ConfigError> {
        let mut next = self.snapshot();
        let applied = next.apply_selector_updates(updates);
        if applied == 0 {
            return Ok(());
        }

        self.write(&next).await?;
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;

        tracing::info!(path = %self.path.display(), applied, "Persisted recovered selectors");
        Ok(())
    }
}
