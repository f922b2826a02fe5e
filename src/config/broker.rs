//! Broker Configuration
//!
//! One entry per upstream/downstream MQTT broker the relay connects to.

use std::time::Duration;

use serde::Deserialize;

/// Reconnect interval used when neither `reconnect_s` nor `reconnect_ms` is set
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Environment variable consulted when a broker has no `url`
pub const BROKER_URL_ENV: &str = "MQTTURL";

/// Lowercase spelling of [`BROKER_URL_ENV`], also accepted
pub const BROKER_URL_ENV_LOWER: &str = "mqtturl";

/// Configuration for a single broker connection
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    /// Unique name; defaults to the broker's index in the list
    #[serde(default)]
    pub name: Option<String>,

    /// Connection URL (`mqtt://host:port`); defaults to `$MQTTURL`
    #[serde(default)]
    pub url: Option<String>,

    /// Reconnect interval, whole seconds part
    #[serde(default, alias = "reconnectS")]
    pub reconnect_s: Option<u64>,

    /// Reconnect interval, milliseconds part
    #[serde(default, alias = "reconnectMs")]
    pub reconnect_ms: Option<u64>,

    /// Client ID presented to the broker
    #[serde(default, alias = "clientId")]
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
}

fn default_keepalive() -> u16 {
    60
}

impl BrokerConfig {
    /// Effective reconnect interval.
    ///
    /// `None` means reconnecting is disabled (an explicit total of zero).
    pub fn reconnect_interval(&self) -> Option<Duration> {
        match (self.reconnect_s, self.reconnect_ms) {
            (None, None) => Some(DEFAULT_RECONNECT_INTERVAL),
            (secs, millis) => {
                let total = secs
                    .unwrap_or(0)
                    .saturating_mul(1000)
                    .saturating_add(millis.unwrap_or(0));
                if total == 0 {
                    None
                } else {
                    Some(Duration::from_millis(total))
                }
            }
        }
    }

    /// Resolved name for the broker at `index`
    pub fn resolved_name(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| index.to_string())
    }

    /// Resolved URL, falling back to the `MQTTURL` (or `mqtturl`) environment variable
    pub fn resolved_url(&self) -> Option<String> {
        self.url
            .clone()
            .or_else(|| {
                [BROKER_URL_ENV, BROKER_URL_ENV_LOWER]
                    .into_iter()
                    .find_map(|key| std::env::var(key).ok().filter(|url| !url.is_empty()))
            })
            .filter(|url| !url.is_empty())
    }

    /// Get the keep-alive as Duration
    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.keepalive as u64)
    }
}
