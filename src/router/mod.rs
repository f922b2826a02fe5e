//! Message Router
//!
//! Subscribes bindings on their source brokers, maps inbound messages to
//! the bindings subscribed to them, and publishes transform output to the
//! destination brokers.
//!
//! Subscriptions are reference counted per `(broker, filter)`: several
//! bindings may share one, and the broker is only told to unsubscribe when
//! the last of them leaves.


use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::debug;

use crate::binding::BindingSpec;
use crate::broker::{BrokerError, BrokerRegistry};
use crate::message::{InboundMessage, OutboundMessage};
use crate::topic::{capture_wildcards, derive_topic, topic_matches_filter};

/// Subscribe-all failed on one broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeError {
    pub broker: String,
    pub filter: String,
    pub source: BrokerError,
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscribe to '{}' on broker '{}' failed: {}",
            self.filter, self.broker, self.source
        )
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// One delivery that did not happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The destination pattern has a `+` with no matching inbound level
    Underivable { pattern: String, inbound: String },
    /// The destination broker refused or could not take the message
    Broker {
        broker: String,
        topic: String,
        source: BrokerError,
    },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Underivable { pattern, inbound } => write!(
                f,
                "cannot derive a topic from '{}' for inbound topic '{}'",
                pattern, inbound
            ),
            PublishError::Broker {
                broker,
                topic,
                source,
            } => write!(
                f,
                "publish to '{}' on broker '{}' failed: {}",
                topic, broker, source
            ),
        }
    }
}

impl std::error::Error for PublishError {}

/// Outcome of delivering one inbound message's output
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Successful (message, broker) publishes
    pub published: usize,
    pub failures: Vec<PublishError>,
}

#[derive(Debug, Clone)]
struct Route {
    binding: String,
    broker: String,
    filter: String,
}

/// Active subscriptions and the bindings behind them
#[derive(Default)]
pub struct SubscriptionTable {
    refs: HashMap<(String, String), usize>,
    routes: Vec<Route>,
}

impl SubscriptionTable {
    /// Record `binding` on `(broker, filter)`; returns the new refcount
    fn add(&mut self, binding: &str, broker: &str, filter: &str) -> usize {
        self.routes.push(Route {
            binding: binding.to_string(),
            broker: broker.to_string(),
            filter: filter.to_string(),
        });
        let count = self
            .refs
            .entry((broker.to_string(), filter.to_string()))
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Drop `binding` from `(broker, filter)`; returns the remaining refcount,
    /// or `None` if the binding was not subscribed there
    fn remove(&mut self, binding: &str, broker: &str, filter: &str) -> Option<usize> {
        let index = self
            .routes
            .iter()
            .position(|r| r.binding == binding && r.broker == broker && r.filter == filter)?;
        self.routes.swap_remove(index);

        let key = (broker.to_string(), filter.to_string());
        let count = self.refs.get_mut(&key)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.refs.remove(&key);
        }
        Some(remaining)
    }

    fn refcount(&self, broker: &str, filter: &str) -> usize {
        self.refs
            .get(&(broker.to_string(), filter.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Bindings subscribed to a filter matching `topic` on `broker`
    fn matching(&self, broker: &str, topic: &str) -> SmallVec<[String; 4]> {
        let mut out: SmallVec<[String; 4]> = SmallVec::new();
        for route in &self.routes {
            if route.broker == broker
                && topic_matches_filter(topic, &route.filter)
                && !out.contains(&route.binding)
            {
                out.push(route.binding.clone());
            }
        }
        out
    }
}

pub struct Router {
    brokers: Arc<BrokerRegistry>,
    table: RwLock<SubscriptionTable>,
}

impl Router {
    pub fn new(brokers: Arc<BrokerRegistry>) -> Self {
        Self {
            brokers,
            table: RwLock::new(SubscriptionTable::default()),
        }
    }

    /// Subscribe `binding.from.topic` on every source broker.
    ///
    /// On failure, subscriptions made by this call are rolled back and the
    /// binding holds none.
    pub async fn subscribe_all(&self, binding: &BindingSpec) -> Result<(), SubscribeError> {
        let filter = &binding.from.topic;
        let mut done: Vec<&str> = Vec::with_capacity(binding.from.brokers.len());

        for broker in &binding.from.brokers {
            match self
                .brokers
                .subscribe(broker, filter, binding.from.qos)
                .await
            {
                Ok(()) => {
                    self.table.write().add(&binding.name, broker, filter);
                    debug!(
                        "Binding '{}': subscribed to '{}' on broker '{}'",
                        binding.name, filter, broker
                    );
                    done.push(broker);
                }
                Err(source) => {
                    for subscribed in done {
                        self.release(&binding.name, subscribed, filter).await;
                    }
                    return Err(SubscribeError {
                        broker: broker.clone(),
                        filter: filter.clone(),
                        source,
                    });
                }
            }
        }

        Ok(())
    }

    /// Drop all of a binding's subscriptions.
    ///
    /// The broker is only asked to unsubscribe when it is still Online and
    /// no other binding shares the subscription.
    pub async fn unsubscribe_all(&self, binding: &BindingSpec) {
        for broker in &binding.from.brokers {
            self.release(&binding.name, broker, &binding.from.topic)
                .await;
        }
    }

    async fn release(&self, binding: &str, broker: &str, filter: &str) {
        let remaining = self.table.write().remove(binding, broker, filter);
        if remaining != Some(0) || !self.brokers.is_online(broker) {
            return;
        }
        if let Err(e) = self.brokers.unsubscribe(broker, filter).await {
            debug!(
                "Binding '{}': unsubscribe from '{}' on broker '{}' failed: {}",
                binding, filter, broker, e
            );
        }
    }

    /// Bindings that should receive a message published to `topic` on `broker`
    pub fn route(&self, broker: &str, topic: &str) -> SmallVec<[String; 4]> {
        self.table.read().matching(broker, topic)
    }

    pub fn subscriber_count(&self, broker: &str, filter: &str) -> usize {
        self.table.read().refcount(broker, filter)
    }

    /// Publish a transform's output to every destination broker.
    ///
    /// Each (message, broker) pair is attempted independently and all are
    /// awaited; a failure is reported without affecting the others.
    pub async fn deliver(
        &self,
        binding: &BindingSpec,
        inbound: &InboundMessage,
        outbound: Vec<OutboundMessage>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        if outbound.is_empty() {
            return report;
        }

        let captures = capture_wildcards(&inbound.topic, &binding.from.topic).unwrap_or_default();
        let Some(topic) = derive_topic(&binding.to.topic, &inbound.topic, &captures) else {
            for _ in &outbound {
                report.failures.push(PublishError::Underivable {
                    pattern: binding.to.topic.clone(),
                    inbound: inbound.topic.clone(),
                });
            }
            return report;
        };

        let topic = topic.as_str();
        let publishes = outbound.iter().flat_map(|message| {
            binding.to.brokers.iter().map(move |broker| async move {
                self.brokers
                    .publish(broker, topic, message.payload.clone(), binding.to.qos)
                    .await
                    .map_err(|source| PublishError::Broker {
                        broker: broker.clone(),
                        topic: topic.to_string(),
                        source,
                    })
            })
        });

        for result in join_all(publishes).await {
            match result {
                Ok(()) => report.published += 1,
                Err(e) => report.failures.push(e),
            }
        }

        report
    }
}
