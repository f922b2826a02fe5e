//! Prometheus metrics for the relay
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Per-binding series are labelled with the binding name.

use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

mod server;


pub use server::MetricsServer;

/// All relay metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Message flow
    pub messages_received: IntCounterVec,
    pub messages_published: IntCounterVec,
    pub messages_dropped: IntCounterVec,
    pub publish_errors: IntCounterVec,

    // Transform scripts
    pub script_errors: IntCounterVec,
    pub script_run_seconds: Histogram,
    pub reloads: IntCounterVec,

    // Lifecycle
    pub retries: IntCounterVec,
    pub binding_online: IntGaugeVec,
    pub broker_online: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = IntCounterVec::new(
            Opts::new(
                "vibemq_relay_messages_received_total",
                "Messages received by a binding",
            ),
            &["binding"],
        )
        .unwrap();

        let messages_published = IntCounterVec::new(
            Opts::new(
                "vibemq_relay_messages_published_total",
                "Messages published by a binding to a destination broker",
            ),
            &["binding"],
        )
        .unwrap();

        let messages_dropped = IntCounterVec::new(
            Opts::new(
                "vibemq_relay_messages_dropped_total",
                "Messages dropped because a binding's queue was full",
            ),
            &["binding"],
        )
        .unwrap();

        let publish_errors = IntCounterVec::new(
            Opts::new(
                "vibemq_relay_publish_errors_total",
                "Failed publishes per binding and destination broker",
            ),
            &["binding", "broker"],
        )
        .unwrap();

        let script_errors = IntCounterVec::new(
            Opts::new(
                "vibemq_relay_script_errors_total",
                "Transform invocations that failed",
            ),
            &["binding"],
        )
        .unwrap();

        let script_run_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vibemq_relay_script_run_seconds",
                "Transform invocation duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();

        let reloads = IntCounterVec::new(
            Opts::new("vibemq_relay_reloads_total", "Script reload attempts"),
            &["binding"],
        )
        .unwrap();

        let retries = IntCounterVec::new(
            Opts::new(
                "vibemq_relay_retries_total",
                "Subscribe retries scheduled after a failed start",
            ),
            &["binding"],
        )
        .unwrap();

        let binding_online = IntGaugeVec::new(
            Opts::new(
                "vibemq_relay_binding_online",
                "1 while the binding is Online",
            ),
            &["binding"],
        )
        .unwrap();

        let broker_online = IntGaugeVec::new(
            Opts::new("vibemq_relay_broker_online", "1 while the broker is Online"),
            &["broker"],
        )
        .unwrap();

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_published.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_dropped.clone()))
            .unwrap();
        registry.register(Box::new(publish_errors.clone())).unwrap();
        registry.register(Box::new(script_errors.clone())).unwrap();
        registry
            .register(Box::new(script_run_seconds.clone()))
            .unwrap();
        registry.register(Box::new(reloads.clone())).unwrap();
        registry.register(Box::new(retries.clone())).unwrap();
        registry.register(Box::new(binding_online.clone())).unwrap();
        registry.register(Box::new(broker_online.clone())).unwrap();

        Metrics {
            registry,
            messages_received,
            messages_published,
            messages_dropped,
            publish_errors,
            script_errors,
            script_run_seconds,
            reloads,
            retries,
            binding_online,
            broker_online,
        }
    }

    pub fn message_received(&self, binding: &str) {
        self.messages_received.with_label_values(&[binding]).inc();
    }

    pub fn messages_published(&self, binding: &str, count: usize) {
        self.messages_published
            .with_label_values(&[binding])
            .inc_by(count as u64);
    }

    pub fn message_dropped(&self, binding: &str) {
        self.messages_dropped.with_label_values(&[binding]).inc();
    }

    pub fn publish_failed(&self, binding: &str, broker: &str) {
        self.publish_errors
            .with_label_values(&[binding, broker])
            .inc();
    }

    pub fn script_failed(&self, binding: &str) {
        self.script_errors.with_label_values(&[binding]).inc();
    }

    pub fn script_ran(&self, elapsed: Duration) {
        self.script_run_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn reloaded(&self, binding: &str) {
        self.reloads.with_label_values(&[binding]).inc();
    }

    pub fn retry_scheduled(&self, binding: &str) {
        self.retries.with_label_values(&[binding]).inc();
    }

    pub fn set_binding_online(&self, binding: &str, online: bool) {
        self.binding_online
            .with_label_values(&[binding])
            .set(i64::from(online));
    }

    pub fn set_broker_online(&self, broker: &str, online: bool) {
        self.broker_online
            .with_label_values(&[broker])
            .set(i64::from(online));
    }

    /// Render every metric in the Prometheus text format
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
