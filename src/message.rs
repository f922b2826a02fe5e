//! Messages flowing through the relay

use bytes::Bytes;

/// A message received from a source broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker the message arrived on
    pub broker: String,
    /// Concrete topic it was published to
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(broker: impl Into<String>, topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            broker: broker.into(),
            topic: topic.into(),
            payload,
        }
    }
}

/// A message queued by a transform for publication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Topic the transform asked for
    pub topic: String,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}
