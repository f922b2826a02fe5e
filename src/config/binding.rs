//! Binding Configuration
//!
//! A binding routes messages from a topic on one or more source brokers to
//! a topic on one or more destination brokers, optionally through a
//! transform script.

use std::path::Path;

use serde::Deserialize;

/// Reference to a broker, either by name or by position in `brokers`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BrokerRef {
    Index(usize),
    Name(String),
}

impl std::fmt::Display for BrokerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerRef::Index(i) => write!(f, "#{}", i),
            BrokerRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// A single value or a list of values
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

/// Source or destination side of a binding
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointConfig {
    /// Broker reference(s); `brokers` wins when both are given
    #[serde(default)]
    pub broker: Option<OneOrMany<BrokerRef>>,

    #[serde(default)]
    pub brokers: Option<OneOrMany<BrokerRef>>,

    /// Topic filter (source) or pattern (destination); defaults to `#`
    #[serde(default)]
    pub topic: Option<String>,

    /// QoS for the subscription or publish
    #[serde(default)]
    pub qos: u8,
}

impl EndpointConfig {
    /// Broker references, defaulting to the first configured broker
    pub fn broker_refs(&self) -> Vec<BrokerRef> {
        self.brokers
            .as_ref()
            .or(self.broker.as_ref())
            .map(OneOrMany::to_vec)
            .unwrap_or_else(|| vec![BrokerRef::Index(0)])
    }

    pub fn topic_or_default(&self) -> &str {
        self.topic.as_deref().unwrap_or("#")
    }
}

/// Configuration for a single binding
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BindingConfig {
    /// Unique name; defaults to the script file stem, else the index
    #[serde(default)]
    pub name: Option<String>,

    /// Transform script path, relative to `bindings_root`
    #[serde(default)]
    pub path: Option<String>,

    /// Inline transform script source (exclusive with `path`)
    #[serde(default, alias = "fn")]
    pub inline: Option<String>,

    #[serde(default)]
    pub from: Option<EndpointConfig>,

    #[serde(default)]
    pub to: Option<EndpointConfig>,

    /// Inactive bindings are registered but never started
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl BindingConfig {
    /// Resolved name for the binding at `index`
    pub fn resolved_name(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.path
            .as_deref()
            .and_then(|p| Path::new(p).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| index.to_string())
    }

    pub fn from_or_default(&self) -> EndpointConfig {
        self.from.clone().unwrap_or_default()
    }

    pub fn to_or_default(&self) -> EndpointConfig {
        self.to.clone().unwrap_or_default()
    }
}
