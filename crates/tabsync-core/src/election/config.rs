//! Configuration for leader election.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Default retry interval for electors awaiting leadership.
pub const DEFAULT_FALLBACK_INTERVAL: Duration = Duration::from_millis(3000);

/// Configuration for an elector.
///
/// Deserializes from the camelCase shape the browser host passes in, with
/// durations in milliseconds:
///
/// ```
/// use tabsync_core::election::ElectionConfig;
///
/// let config: ElectionConfig =
///     serde_json::from_str(r#"{"responseTime": 100, "dictator": true}"#).unwrap();
/// assert_eq!(config.response_time.unwrap().as_millis(), 100);
/// assert_eq!(config.fallback_interval.as_millis(), 3000);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ElectionConfig {
    /// How long to wait for objections after each APPLY.
    /// `None` uses the channel's average response time.
    #[serde(deserialize_with = "millis_opt")]
    pub response_time: Option<Duration>,
    /// How often an elector awaiting leadership re-applies (default: 3s).
    #[serde(deserialize_with = "millis")]
    pub fallback_interval: Duration,
    /// Win every contest against non-dictators and depose a non-dictator leader.
    pub dictator: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            response_time: None,
            fallback_interval: DEFAULT_FALLBACK_INTERVAL,
            dictator: false,
        }
    }
}

impl ElectionConfig {
    pub fn dictator() -> Self {
        Self {
            dictator: true,
            ..Self::default()
        }
    }

    pub fn with_response_time(mut self, response_time: Duration) -> Self {
        self.response_time = Some(response_time);
        self
    }

    pub fn with_fallback_interval(mut self, fallback_interval: Duration) -> Self {
        self.fallback_interval = fallback_interval;
        self
    }
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
}

fn millis_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
}
