//! Broker Connection Manager
//!
//! Creates one [`MqttClient`] per configured broker and attaches it to the
//! registry. A connect that fails synchronously is returned to the caller;
//! transient drops afterwards are handled by the client's reconnect policy.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use super::{BrokerNotice, BrokerRegistry, BrokerSpec, ConnectError, MqttClient};

/// Default MQTT port when the URL has none
pub const DEFAULT_PORT: u16 = 1883;

/// Split an `mqtt://host[:port]` or `tcp://host[:port]` URL
pub fn parse_broker_url(url: &str) -> Result<(String, u16), ConnectError> {
    let invalid = || ConnectError::InvalidUrl(url.to_string());

    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .ok_or_else(invalid)?
        .trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') || rest.contains('@') {
        return Err(invalid());
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            (host, port.parse::<u16>().map_err(|_| invalid())?)
        }
        Some(_) => return Err(invalid()),
        None => (rest, DEFAULT_PORT),
    };
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Owns the process's broker connections
pub struct BrokerManager {
    registry: Arc<BrokerRegistry>,
    notices: mpsc::Sender<BrokerNotice>,
}

impl BrokerManager {
    pub fn new(registry: Arc<BrokerRegistry>, notices: mpsc::Sender<BrokerNotice>) -> Self {
        Self { registry, notices }
    }

    /// Connect one broker and attach it to the registry
    pub async fn connect(&self, spec: &BrokerSpec) -> Result<(), ConnectError> {
        let client = MqttClient::connect(spec, self.notices.clone()).await?;
        self.registry.attach(&spec.name, Arc::new(client));
        info!("Broker '{}': connecting to {}", spec.name, spec.url);
        Ok(())
    }

    /// Connect every broker, stopping at the first synchronous failure
    pub async fn connect_all(&self, specs: &[BrokerSpec]) -> Result<(), ConnectError> {
        for spec in specs {
            self.connect(spec).await?;
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        self.registry.disconnect_all().await;
    }
}
