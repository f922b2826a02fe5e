//! VibeMQ Relay - MQTT-to-MQTT binding engine
//!
//! Subscribes to topics on one or more brokers, runs each message through a
//! sandboxed WebAssembly transform, and republishes the results to
//! destination brokers under a rewritten topic.

pub mod binding;
pub mod broker;
pub mod config;
pub mod message;
pub mod metrics;
pub mod relay;
pub mod retry;
pub mod router;
pub mod sandbox;
pub mod topic;
pub mod watch;

pub use binding::{BindingRegistry, BindingSpec, BindingStatus};
pub use broker::{BrokerClient, BrokerError, BrokerNotice, BrokerRegistry, BrokerStatus};
pub use config::Config;
pub use message::{InboundMessage, OutboundMessage};
pub use metrics::{Metrics, MetricsServer};
pub use relay::{Relay, RelayError};
pub use sandbox::{SandboxEngine, ScriptLoadError, ScriptRuntimeError};
