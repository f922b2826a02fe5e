//! Bindings
//!
//! A binding routes messages from a source topic on one or more brokers,
//! through a transform, to a destination topic on one or more brokers.
//!
//! Each active binding is driven by its own [`BindingActor`] task; all of
//! its events (broker up/down, inbound messages, script changes, retries)
//! are processed in FIFO order from one channel. Status lives in the shared
//! [`BindingRegistry`], which enforces the legal transitions.

mod actor;
mod registry;


use std::fmt;
use std::path::PathBuf;

pub use actor::{BindingActor, BindingDeps, BindingEvent, BindingHandle};
pub use registry::{BindingRegistry, BindingSnapshot, TransitionError};

/// Lifecycle state of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingStatus {
    /// Configured with `active = false`; never leaves this state
    Inactive,
    /// Script being read and compiled
    Loading,
    /// Loaded; waiting for all brokers
    Offline,
    /// Subscribing on the source brokers
    Starting,
    /// Routing messages
    Online,
    /// Load failed, or the binding was rejected
    Error,
    /// Script being replaced
    Reloading,
}

impl BindingStatus {
    /// Whether `self -> next` is a legal edge of the state machine
    pub fn can_transition_to(self, next: BindingStatus) -> bool {
        use BindingStatus::*;

        matches!(
            (self, next),
            (Loading, Offline)
                | (Loading, Error)
                | (Offline, Starting)
                | (Offline, Reloading)
                | (Starting, Online)
                | (Starting, Offline)
                | (Starting, Reloading)
                | (Online, Offline)
                | (Online, Reloading)
                | (Error, Reloading)
                | (Reloading, Offline)
                | (Reloading, Error)
        )
    }
}

impl fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BindingStatus::Inactive => "inactive",
            BindingStatus::Loading => "loading",
            BindingStatus::Offline => "offline",
            BindingStatus::Starting => "starting",
            BindingStatus::Online => "online",
            BindingStatus::Error => "error",
            BindingStatus::Reloading => "reloading",
        };
        write!(f, "{}", s)
    }
}

/// Topic pattern plus the brokers it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub topic: String,
    /// Ordered, deduplicated broker names
    pub brokers: Vec<String>,
    pub qos: u8,
}

impl TopicSpec {
    pub fn new(topic: &str, brokers: Vec<String>, qos: u8) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(brokers.len());
        for broker in brokers {
            if !unique.contains(&broker) {
                unique.push(broker);
            }
        }
        Self {
            topic: topic.to_string(),
            brokers: unique,
            qos,
        }
    }
}

/// Where a binding's transform comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// No script; messages pass through unchanged
    Identity,
    /// Module file (`.wasm` or `.wat`), watched for changes
    File(PathBuf),
    /// Module text embedded in the configuration
    Inline(String),
}

impl ScriptSource {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ScriptSource::File(path) => Some(path),
            _ => None,
        }
    }
}

/// A validated binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub name: String,
    pub from: TopicSpec,
    pub to: TopicSpec,
    pub script: ScriptSource,
    pub active: bool,
}

impl BindingSpec {
    /// Union of `from` and `to` brokers, in order, without duplicates
    pub fn brokers(&self) -> Vec<String> {
        let mut all = self.from.brokers.clone();
        for broker in &self.to.brokers {
            if !all.contains(broker) {
                all.push(broker.clone());
            }
        }
        all
    }

    pub fn depends_on(&self, broker: &str) -> bool {
        self.from.brokers.iter().any(|b| b == broker) || self.to.brokers.iter().any(|b| b == broker)
    }
}

/// A binding that referenced a broker that does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedBinding {
    pub name: String,
    pub reason: String,
    pub active: bool,
}
