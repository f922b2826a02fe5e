//! Binding State Machine
//!
//! One task per active binding, handling one event at a time, so there is
//! never more than one transform run or load in flight for a binding and a
//! reload always waits for the current run.
//!
//! Inbound messages arrive on a bounded queue. Lifecycle events (broker
//! up/down, reloads, retries, shutdown) arrive on an unbounded control
//! queue that is drained first, so sending one never waits behind data.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BindingRegistry, BindingSpec, BindingStatus};
use crate::broker::BrokerRegistry;
use crate::message::InboundMessage;
use crate::metrics::Metrics;
use crate::retry::{RetryController, RetryPolicy};
use crate::router::{PublishError, Router};
use crate::sandbox::{SandboxEngine, Transform};

/// Lifecycle input to a binding's state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEvent {
    /// A broker this binding depends on came Online
    BrokerUp(String),
    /// A broker this binding depends on went Offline
    BrokerDown(String),
    /// The script changed or a reload was requested
    ScriptChanged,
    /// A scheduled subscribe retry fired
    RetryDue { generation: u64 },
    /// Stop the actor
    Shutdown,
}

/// Sending side of a running binding actor
#[derive(Clone)]
pub struct BindingHandle {
    name: String,
    control: mpsc::UnboundedSender<BindingEvent>,
    inbound: mpsc::Sender<InboundMessage>,
}

impl BindingHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an inbound message; fails when the queue is full or closed
    pub fn offer(&self, message: InboundMessage) -> Result<(), TrySendError<InboundMessage>> {
        self.inbound.try_send(message)
    }

    /// Queue a lifecycle event; false when the actor has stopped
    pub fn notify(&self, event: BindingEvent) -> bool {
        self.control.send(event).is_ok()
    }

    pub fn control(&self) -> mpsc::UnboundedSender<BindingEvent> {
        self.control.clone()
    }
}

/// Shared services every binding actor uses
#[derive(Clone)]
pub struct BindingDeps {
    pub bindings: Arc<BindingRegistry>,
    pub brokers: Arc<BrokerRegistry>,
    pub router: Arc<Router>,
    pub sandbox: Arc<SandboxEngine>,
    pub metrics: Arc<Metrics>,
    pub retry: RetryPolicy,
}

pub struct BindingActor {
    spec: Arc<BindingSpec>,
    deps: BindingDeps,
    transform: Option<Transform>,
    retry: RetryController,
    control_tx: mpsc::UnboundedSender<BindingEvent>,
    control: mpsc::UnboundedReceiver<BindingEvent>,
    inbound: mpsc::Receiver<InboundMessage>,
    consecutive_timeouts: u32,
}

impl BindingActor {
    /// Create the actor and its handle. The binding must already be
    /// registered in `Loading`; `queue` bounds the inbound messages.
    pub fn new(spec: Arc<BindingSpec>, deps: BindingDeps, queue: usize) -> (Self, BindingHandle) {
        let (control_tx, control) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::channel(queue.max(1));
        let handle = BindingHandle {
            name: spec.name.clone(),
            control: control_tx.clone(),
            inbound: inbound_tx,
        };
        let retry = RetryController::new(spec.name.clone(), deps.retry);

        let actor = Self {
            spec,
            deps,
            transform: None,
            retry,
            control_tx,
            control,
            inbound,
            consecutive_timeouts: 0,
        };
        (actor, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        self.load().await;
        self.evaluate().await;

        loop {
            tokio::select! {
                biased;
                event = self.control.recv() => match event {
                    Some(BindingEvent::Shutdown) | None => break,
                    Some(event) => self.on_control(event).await,
                },
                Some(message) = self.inbound.recv() => self.on_message(message).await,
            }
        }

        self.stop().await;
    }

    async fn on_control(&mut self, event: BindingEvent) {
        match event {
            BindingEvent::BrokerUp(broker) => {
                debug!("Binding '{}': broker '{}' up", self.spec.name, broker);
                self.evaluate().await;
            }
            BindingEvent::BrokerDown(broker) => self.on_broker_down(&broker).await,
            BindingEvent::ScriptChanged => self.reload().await,
            BindingEvent::RetryDue { generation } => {
                if self.retry.accept(generation) {
                    self.evaluate().await;
                }
            }
            BindingEvent::Shutdown => {}
        }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    fn status(&self) -> Option<BindingStatus> {
        self.deps.bindings.status(&self.spec.name)
    }

    fn set_status(&self, next: BindingStatus) -> bool {
        match self.deps.bindings.transition(&self.spec.name, next) {
            Ok(previous) => {
                debug!("Binding '{}': {} -> {}", self.name(), previous, next);
                self.deps
                    .metrics
                    .set_binding_online(self.name(), next == BindingStatus::Online);
                true
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    fn set_error(&self, message: String) {
        error!("Binding '{}': {}", self.name(), message);
        if let Err(e) = self.deps.bindings.fail(&self.spec.name, message) {
            error!("{}", e);
        }
        self.deps.metrics.set_binding_online(self.name(), false);
    }

    /// Loading -> Offline | Error
    async fn load(&mut self) {
        match self.deps.sandbox.load(&self.spec.name, &self.spec.script).await {
            Ok(transform) => {
                self.transform = Some(transform);
                if self.set_status(BindingStatus::Offline) {
                    info!("Binding '{}': loaded", self.name());
                }
            }
            Err(e) => self.set_error(e.to_string()),
        }
    }

    /// Start routing if Offline and every broker is Online
    async fn evaluate(&mut self) {
        if self.status() != Some(BindingStatus::Offline) {
            return;
        }
        if !self.deps.brokers.all_online(&self.spec.brokers()) {
            return;
        }
        self.start().await;
    }

    /// Offline -> Starting -> Online | Offline (retry scheduled)
    async fn start(&mut self) {
        if !self.set_status(BindingStatus::Starting) {
            return;
        }

        match self.deps.router.subscribe_all(&self.spec).await {
            Ok(()) => {
                if self.set_status(BindingStatus::Online) {
                    self.retry.reset();
                    info!(
                        "Binding '{}': online, routing '{}' -> '{}'",
                        self.name(),
                        self.spec.from.topic,
                        self.spec.to.topic
                    );
                }
            }
            Err(e) => {
                warn!("Binding '{}': start failed: {}", self.name(), e);
                self.set_status(BindingStatus::Offline);
                if self.retry.schedule(&self.control_tx).is_some() {
                    self.deps.metrics.retry_scheduled(self.name());
                }
            }
        }
    }

    /// Online -> Offline when a dependency goes away
    async fn on_broker_down(&mut self, broker: &str) {
        self.retry.cancel();

        if self.status() == Some(BindingStatus::Online) {
            self.deps.router.unsubscribe_all(&self.spec).await;
            self.set_status(BindingStatus::Offline);
            info!(
                "Binding '{}': offline, broker '{}' went down",
                self.name(),
                broker
            );
        }
    }

    async fn on_message(&mut self, message: InboundMessage) {
        if self.status() != Some(BindingStatus::Online) {
            debug!(
                "Binding '{}': not online, dropping message on '{}'",
                self.name(),
                message.topic
            );
            self.deps.metrics.message_dropped(self.name());
            return;
        }
        if let Some(broker) = self
            .spec
            .brokers()
            .into_iter()
            .find(|b| !self.deps.brokers.is_online(b))
        {
            self.deps.metrics.message_dropped(self.name());
            self.on_broker_down(&broker).await;
            debug!(
                "Binding '{}': broker '{}' offline, dropping message on '{}'",
                self.name(),
                broker,
                message.topic
            );
            return;
        }
        let Some(transform) = self.transform.take() else {
            warn!(
                "Binding '{}': no transform loaded, dropping message on '{}'",
                self.name(),
                message.topic
            );
            self.deps.metrics.message_dropped(self.name());
            self.restore().await;
            return;
        };

        self.deps.metrics.message_received(self.name());
        let started = Instant::now();
        let (transform, result) = SandboxEngine::run(transform, message.clone()).await;
        self.deps.metrics.script_ran(started.elapsed());
        self.transform = transform;

        match result {
            Ok(outbound) => {
                self.consecutive_timeouts = 0;
                let report = self
                    .deps
                    .router
                    .deliver(&self.spec, &message, outbound)
                    .await;
                for failure in &report.failures {
                    warn!("Binding '{}': {}", self.name(), failure);
                    let broker = match failure {
                        PublishError::Broker { broker, .. } => broker.as_str(),
                        PublishError::Underivable { .. } => "",
                    };
                    self.deps.metrics.publish_failed(self.name(), broker);
                }
                self.deps
                    .metrics
                    .messages_published(self.name(), report.published);
            }
            Err(e) => {
                self.deps.metrics.script_failed(self.name());
                if e.is_timeout() {
                    self.consecutive_timeouts += 1;
                    warn!(
                        "Binding '{}': dropping message on '{}': {} ({} consecutive)",
                        self.name(),
                        message.topic,
                        e,
                        self.consecutive_timeouts
                    );
                } else {
                    self.consecutive_timeouts = 0;
                    warn!(
                        "Binding '{}': dropping message on '{}': {}",
                        self.name(),
                        message.topic,
                        e
                    );
                }
            }
        }

        if self.transform.is_none() {
            self.restore().await;
        }
    }

    /// Reinstantiate after the run worker died with the context.
    ///
    /// Goes through `Reloading`, so a failure leaves the binding in `Error`.
    async fn restore(&mut self) {
        error!("Binding '{}': transform lost, reloading", self.name());
        self.reload().await;
    }

    /// {Offline, Starting, Online, Error} -> Reloading -> Offline | Error
    ///
    /// A failed reload keeps the previous transform.
    async fn reload(&mut self) {
        let Some(previous) = self.status() else {
            return;
        };
        if !previous.can_transition_to(BindingStatus::Reloading) {
            debug!(
                "Binding '{}': ignoring reload while {}",
                self.name(),
                previous
            );
            return;
        }

        self.retry.cancel();
        if previous == BindingStatus::Online {
            self.deps.router.unsubscribe_all(&self.spec).await;
        }
        if !self.set_status(BindingStatus::Reloading) {
            return;
        }
        self.deps.metrics.reloaded(self.name());
        info!("Binding '{}': reloading script", self.name());

        match self.deps.sandbox.load(&self.spec.name, &self.spec.script).await {
            Ok(transform) => {
                self.transform = Some(transform);
                self.consecutive_timeouts = 0;
                if self.set_status(BindingStatus::Offline) {
                    info!("Binding '{}': reloaded", self.name());
                }
                self.evaluate().await;
            }
            Err(e) => self.set_error(format!("reload failed: {}", e)),
        }
    }

    async fn stop(&mut self) {
        self.retry.cancel();
        if self.status() == Some(BindingStatus::Online) {
            self.deps.router.unsubscribe_all(&self.spec).await;
        }
        self.deps.metrics.set_binding_online(self.name(), false);
        debug!("Binding '{}': stopped", self.name());
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::binding::{ScriptSource, TopicSpec};
    use crate::config::SandboxConfig;

    /// An Online binding whose transform is gone and whose script file is missing
    fn stranded() -> (BindingActor, Arc<BindingRegistry>, Arc<Metrics>) {
        let bindings = Arc::new(BindingRegistry::new());
        bindings.register("lost", true);
        for next in [
            BindingStatus::Offline,
            BindingStatus::Starting,
            BindingStatus::Online,
        ] {
            bindings.transition("lost", next).unwrap();
        }

        let brokers = Arc::new(BrokerRegistry::new(&[]));
        let metrics = Arc::new(Metrics::new());
        let deps = BindingDeps {
            bindings: bindings.clone(),
            router: Arc::new(Router::new(brokers.clone())),
            brokers,
            sandbox: Arc::new(SandboxEngine::new(SandboxConfig::default()).unwrap()),
            metrics: metrics.clone(),
            retry: RetryPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(10),
                multiplier: 2.0,
            },
        };
        let spec = Arc::new(BindingSpec {
            name: "lost".into(),
            from: TopicSpec::new("in", vec![], 0),
            to: TopicSpec::new("out", vec![], 0),
            script: ScriptSource::File(PathBuf::from("/nonexistent/lost.wat")),
            active: true,
        });
        let (actor, _handle) = BindingActor::new(spec, deps, 4);
        (actor, bindings, metrics)
    }

    #[tokio::test]
    async fn test_failed_restore_moves_to_error() {
        let (mut actor, bindings, _) = stranded();
        actor.restore().await;

        assert_eq!(bindings.status("lost"), Some(BindingStatus::Error));
        assert!(bindings.error("lost").unwrap().starts_with("reload failed"));
        assert!(actor.transform.is_none());
    }

    #[tokio::test]
    async fn test_message_without_transform_is_counted_and_recovers() {
        let (mut actor, bindings, metrics) = stranded();
        let message = InboundMessage::new("local", "in", Bytes::from_static(b"x"));
        actor.on_message(message.clone()).await;

        assert_eq!(
            metrics.messages_dropped.with_label_values(&["lost"]).get(),
            1
        );
        assert_eq!(bindings.status("lost"), Some(BindingStatus::Error));

        // Later messages are dropped as not online, not silently lost
        actor.on_message(message).await;
        assert_eq!(
            metrics.messages_dropped.with_label_values(&["lost"]).get(),
            2
        );
        assert_eq!(
            metrics.messages_received.with_label_values(&["lost"]).get(),
            0
        );
    }
}
