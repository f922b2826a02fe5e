//! Broker Registry
//!
//! Maps broker name to status and client handle. Status is mutated only
//! through [`BrokerRegistry::apply`].

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::{BrokerClient, BrokerError, BrokerEvent, BrokerSpec, BrokerStatus};

/// What a broker event means for the bindings that depend on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerTransition {
    /// Broker became Online
    Up,
    /// Broker left Online
    Down,
    /// Unrecoverable error for the process owner to handle
    Fatal(String),
    /// Nothing for bindings to react to
    Unchanged,
}

struct BrokerEntry {
    status: BrokerStatus,
    client: Option<Arc<dyn BrokerClient>>,
}

/// Registry of configured brokers
pub struct BrokerRegistry {
    entries: DashMap<String, BrokerEntry>,
}

impl BrokerRegistry {
    /// Create an entry in `Init` for every configured broker
    pub fn new(specs: &[BrokerSpec]) -> Self {
        let entries = DashMap::with_capacity(specs.len());
        for spec in specs {
            entries.insert(
                spec.name.clone(),
                BrokerEntry {
                    status: BrokerStatus::Init,
                    client: None,
                },
            );
        }
        Self { entries }
    }

    /// Attach the live client handle for a broker
    pub fn attach(&self, name: &str, client: Arc<dyn BrokerClient>) {
        self.entries
            .entry(name.to_string())
            .or_insert_with(|| BrokerEntry {
                status: BrokerStatus::Init,
                client: None,
            })
            .client = Some(client);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<BrokerStatus> {
        self.entries.get(name).map(|e| e.status)
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.status(name) == Some(BrokerStatus::Online)
    }

    /// Whether every named broker is Online
    pub fn all_online<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> bool {
        names.into_iter().all(|name| self.is_online(name))
    }

    /// Name and status of every broker, sorted by name
    pub fn snapshot(&self) -> Vec<(String, BrokerStatus)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.status))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Apply a connection event and report what changed
    pub fn apply(&self, name: &str, event: &BrokerEvent) -> BrokerTransition {
        let Some(mut entry) = self.entries.get_mut(name) else {
            warn!("Broker '{}': event {:?} for unknown broker", name, event);
            return BrokerTransition::Unchanged;
        };

        let previous = entry.status;
        match event {
            BrokerEvent::Connected => {
                entry.status = BrokerStatus::Online;
                if previous == BrokerStatus::Online {
                    BrokerTransition::Unchanged
                } else {
                    info!("Broker '{}': online", name);
                    BrokerTransition::Up
                }
            }
            BrokerEvent::Disconnected => {
                debug!("Broker '{}': disconnected", name);
                BrokerTransition::Unchanged
            }
            BrokerEvent::WentOffline => {
                entry.status = BrokerStatus::Offline;
                if previous == BrokerStatus::Online {
                    warn!("Broker '{}': offline", name);
                    BrokerTransition::Down
                } else {
                    BrokerTransition::Unchanged
                }
            }
            BrokerEvent::FatalError(msg) => {
                entry.status = BrokerStatus::Offline;
                error!("Broker '{}': fatal error: {}", name, msg);
                BrokerTransition::Fatal(msg.clone())
            }
        }
    }

    /// Look up the client for an Online broker.
    ///
    /// Unknown names fail before anything touches the network.
    fn online_client(&self, name: &str) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| BrokerError::UnknownBroker(name.to_string()))?;
        if entry.status != BrokerStatus::Online {
            return Err(BrokerError::NotConnected(name.to_string()));
        }
        entry
            .client
            .clone()
            .ok_or_else(|| BrokerError::NotConnected(name.to_string()))
    }

    pub async fn publish(
        &self,
        name: &str,
        topic: &str,
        payload: Bytes,
        qos: u8,
    ) -> Result<(), BrokerError> {
        let client = self.online_client(name)?;
        client.publish(topic, payload, qos).await
    }

    pub async fn subscribe(&self, name: &str, filter: &str, qos: u8) -> Result<(), BrokerError> {
        let client = self.online_client(name)?;
        client.subscribe(filter, qos).await
    }

    pub async fn unsubscribe(&self, name: &str, filter: &str) -> Result<(), BrokerError> {
        let client = self.online_client(name)?;
        client.unsubscribe(filter).await
    }

    /// Disconnect every attached client
    pub async fn disconnect_all(&self) {
        let clients: Vec<(String, Arc<dyn BrokerClient>)> = self
            .entries
            .iter()
            .filter_map(|e| e.client.clone().map(|c| (e.key().clone(), c)))
            .collect();

        for (name, client) in clients {
            if let Err(e) = client.disconnect().await {
                debug!("Broker '{}': disconnect failed: {}", name, e);
            }
        }
    }
}
