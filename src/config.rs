//! Support for library configuration options

use std::convert::TryFrom;
use std::error::Error;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Part of the `User-Agent` string that describes the organization (example: `ABC Corporation WebcalPantry/0.1`).
/// Feel free to override it when initing this library.
pub static ORG_NAME: Lazy<Arc<Mutex<String>>> = Lazy::new(|| Arc::new(Mutex::new("My organization".to_string())));

/// Part of the `User-Agent` string that describes the product name.
/// Feel free to override it when initing this library.
pub static PRODUCT_NAME: Lazy<Arc<Mutex<String>>> = Lazy::new(|| Arc::new(Mutex::new("WebcalPantry".to_string())));

/// Refresh interval used for subscriptions that do not set their own
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// A failing feed is retried at least this often, whatever its backoff says
pub const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);
/// Singular occurrences that started more than this many days ago are not cached
pub const STALE_SINGULAR_AGE_DAYS: i64 = 60;
/// Query windows are widened by this much on both sides.
///
/// Many feeds store all-day events at UTC midnight, which shifts them by a few hours once they are displayed in a local zone.
pub const WINDOW_WIDENING_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The `User-Agent` header sent when fetching feeds
pub fn user_agent() -> String {
    let org = ORG_NAME.lock().map(|s| s.clone()).unwrap_or_default();
    let product = PRODUCT_NAME.lock().map(|s| s.clone()).unwrap_or_default();
    format!("{} {}/{}", org, product, env!("CARGO_PKG_VERSION"))
}


/// Tunables of a [`SubscriptionRegistry`](crate::registry::SubscriptionRegistry)
///
/// Every field has a default, so that a JSON file only needs to mention the values it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_refresh_interval_secs: u64,
    pub backoff_ceiling_secs: u64,
    pub stale_singular_age_days: i64,
    pub window_widening_millis: i64,
    pub fetch_timeout_secs: u64,
    pub parse_timeout_secs: u64,
    /// How many calendars `refresh_all` refreshes at the same time
    pub max_concurrent_refreshes: usize,
    /// Upper bound of a per-calendar offset added to the refresh interval, so that many subscriptions do not all refresh in the same cycle.
    /// `0` disables it.
    pub refresh_jitter_secs: u64,
    pub trigger_period_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            backoff_ceiling_secs: BACKOFF_CEILING.as_secs(),
            stale_singular_age_days: STALE_SINGULAR_AGE_DAYS,
            window_widening_millis: WINDOW_WIDENING_MILLIS,
            fetch_timeout_secs: 30,
            parse_timeout_secs: 30,
            max_concurrent_refreshes: 4,
            refresh_jitter_secs: 0,
            trigger_period_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
        }
    }
}

impl Config {
    /// Read a configuration from a JSON file.
    /// Returns an error in case the file cannot be opened or is not valid
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn Error>> {
        let config = match std::fs::File::open(path) {
            Err(err) => {
                return Err(format!("Unable to open file {:?}: {}", path, err).into());
            },
            Ok(file) => serde_json::from_reader(file)?,
        };
        Ok(config)
    }

    pub fn default_refresh_interval_millis(&self) -> i64 {
        secs_to_millis(self.default_refresh_interval_secs)
    }
    pub fn backoff_ceiling_millis(&self) -> i64 {
        secs_to_millis(self.backoff_ceiling_secs)
    }
    pub fn stale_singular_age_millis(&self) -> i64 {
        self.stale_singular_age_days.saturating_mul(24 * 60 * 60 * 1000)
    }
    pub fn fetch_timeout(&self) -> Duration { Duration::from_secs(self.fetch_timeout_secs) }
    pub fn parse_timeout(&self) -> Duration { Duration::from_secs(self.parse_timeout_secs) }
    pub fn trigger_period(&self) -> Duration { Duration::from_secs(self.trigger_period_secs.max(1)) }
}

pub(crate) fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{ "fetch_timeout_secs": 5, "refresh_jitter_secs": 60 }"#).unwrap();
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.refresh_jitter_secs, 60);
        assert_eq!(config.default_refresh_interval_millis(), 300_000);
        assert_eq!(config.backoff_ceiling_millis(), 86_400_000);
        assert_eq!(config.window_widening_millis, WINDOW_WIDENING_MILLIS);
    }

    #[test]
    fn config_from_missing_file() {
        assert!(Config::from_file(Path::new("this/file/does/not/exist.json")).is_err());
    }

    #[test]
    fn user_agent_mentions_product() {
        assert!(user_agent().contains("WebcalPantry/"));
    }
}
