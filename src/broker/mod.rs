//! Broker Connections
//!
//! One client connection per configured broker. Each connection reports
//! its lifecycle through [`BrokerNotice`]s on a single channel; the relay
//! applies them to the [`BrokerRegistry`], which owns broker status and
//! turns raw connection events into up/down transitions for bindings.

mod ack;
mod manager;
mod mqtt;
mod registry;


use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub use manager::{parse_broker_url, BrokerManager};
pub use mqtt::MqttClient;
pub use registry::{BrokerRegistry, BrokerTransition};

use crate::message::InboundMessage;

/// Resolved broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSpec {
    pub name: String,
    pub url: String,
    /// Delay between reconnect attempts; `None` disables reconnecting
    pub reconnect: Option<Duration>,
    pub client_id: String,
    pub keepalive: Duration,
}

/// Connection status of a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    /// Created, never connected
    Init,
    /// Connected and usable
    Online,
    /// Connection given up
    Offline,
}

impl fmt::Display for BrokerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerStatus::Init => write!(f, "init"),
            BrokerStatus::Online => write!(f, "online"),
            BrokerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Raw events reported by a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Session established
    Connected,
    /// Network drop; the client may reconnect on its own
    Disconnected,
    /// The client gave up on the connection
    WentOffline,
    /// Unrecoverable failure, surfaced to the process owner
    FatalError(String),
}

/// Everything a broker connection tells the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerNotice {
    Status { broker: String, event: BrokerEvent },
    Message(InboundMessage),
}

impl BrokerNotice {
    pub fn status(broker: impl Into<String>, event: BrokerEvent) -> Self {
        BrokerNotice::Status {
            broker: broker.into(),
            event,
        }
    }
}

/// Failure to establish a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The URL is not `mqtt://` or `tcp://` host with optional port
    InvalidUrl(String),
    /// The host name does not resolve
    Unresolvable(String),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidUrl(url) => write!(f, "invalid broker URL '{}'", url),
            ConnectError::Unresolvable(host) => write!(f, "cannot resolve broker host '{}'", host),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Failure of an operation on a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No connection with this name exists
    UnknownBroker(String),
    /// The connection exists but is not Online
    NotConnected(String),
    /// The client rejected the request
    Client(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::UnknownBroker(name) => write!(f, "unknown broker '{}'", name),
            BrokerError::NotConnected(name) => write!(f, "broker '{}' is not connected", name),
            BrokerError::Client(msg) => write!(f, "client error: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Client-side primitives a broker connection provides.
///
/// Implemented by [`MqttClient`] for real brokers and by in-memory fakes in
/// tests.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError>;

    /// Publish one message; returns once the broker has acknowledged it
    async fn publish(&self, topic: &str, payload: Bytes, qos: u8) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}
