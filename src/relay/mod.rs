//! Relay
//!
//! Ties everything together: resolves the configuration, connects brokers,
//! spawns one actor per active binding (plus a script watcher for file
//! scripts) and dispatches broker notices. Status events fan out to the
//! bindings that depend on the broker; messages go to the bindings whose
//! subscriptions match.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::binding::{
    BindingActor, BindingDeps, BindingEvent, BindingHandle, BindingRegistry, BindingSnapshot,
    BindingSpec, BindingStatus, ScriptSource,
};
use crate::broker::{
    BrokerClient, BrokerError, BrokerManager, BrokerNotice, BrokerRegistry, BrokerStatus,
    BrokerTransition, ConnectError,
};
use crate::config::{Config, ConfigError, Topology};
use crate::message::InboundMessage;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::sandbox::SandboxEngine;
use crate::watch::ScriptWatcher;

/// How long each task gets to finish during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that stop the relay
#[derive(Debug)]
pub enum RelayError {
    /// Configuration could not be resolved
    Config(ConfigError),
    /// A broker could not be set up at startup
    Connect { broker: String, source: ConnectError },
    /// A broker connection failed unrecoverably
    BrokerFatal { broker: String, message: String },
    /// The sandbox engine could not be created
    Sandbox(anyhow::Error),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Config(e) => write!(f, "{}", e),
            RelayError::Connect { broker, source } => {
                write!(f, "broker '{}': {}", broker, source)
            }
            RelayError::BrokerFatal { broker, message } => {
                write!(f, "broker '{}' failed: {}", broker, message)
            }
            RelayError::Sandbox(e) => write!(f, "sandbox: {:#}", e),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Config(e) => Some(e),
            RelayError::Connect { source, .. } => Some(source),
            RelayError::BrokerFatal { .. } => None,
            RelayError::Sandbox(e) => Some(e.as_ref()),
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        RelayError::Config(e)
    }
}

pub struct Relay {
    config: Config,
    topology: Topology,
    specs: Vec<Arc<BindingSpec>>,
    bindings: Arc<BindingRegistry>,
    brokers: Arc<BrokerRegistry>,
    router: Arc<Router>,
    sandbox: Arc<SandboxEngine>,
    metrics: Arc<Metrics>,
    handles: RwLock<HashMap<String, BindingHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    watch_stop: broadcast::Sender<()>,
    started: AtomicBool,
}

impl Relay {
    /// Resolve the configuration and build the registries.
    ///
    /// Bindings referencing unknown brokers are registered in `Error`
    /// (or `Inactive`) and never started.
    pub fn new(config: Config) -> Result<Self, RelayError> {
        Self::with_metrics(config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(config: Config, metrics: Arc<Metrics>) -> Result<Self, RelayError> {
        let topology = config.resolve()?;

        let bindings = Arc::new(BindingRegistry::new());
        for spec in &topology.bindings {
            bindings.register(&spec.name, spec.active);
            metrics.set_binding_online(&spec.name, false);
        }
        for rejected in &topology.rejected {
            let status = bindings.register_rejected(&rejected.name, &rejected.reason, rejected.active);
            if status == BindingStatus::Error {
                error!("Binding '{}': rejected: {}", rejected.name, rejected.reason);
            }
        }

        let brokers = Arc::new(BrokerRegistry::new(&topology.brokers));
        for spec in &topology.brokers {
            metrics.set_broker_online(&spec.name, false);
        }

        let router = Arc::new(Router::new(brokers.clone()));
        let sandbox =
            Arc::new(SandboxEngine::new(config.sandbox.clone()).map_err(RelayError::Sandbox)?);
        let specs = topology.bindings.iter().cloned().map(Arc::new).collect();
        let (shutdown, _) = watch::channel(false);
        let (watch_stop, _) = broadcast::channel(1);

        Ok(Self {
            config,
            topology,
            specs,
            bindings,
            brokers,
            router,
            sandbox,
            metrics,
            handles: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            watch_stop,
            started: AtomicBool::new(false),
        })
    }

    /// Open an MQTT connection to every configured broker.
    ///
    /// Connection progress is reported on `notices`, which must be the
    /// sending half of the channel passed to [`Relay::run`].
    pub async fn connect_brokers(
        &self,
        notices: mpsc::Sender<BrokerNotice>,
    ) -> Result<(), RelayError> {
        let manager = BrokerManager::new(self.brokers.clone(), notices);
        for spec in &self.topology.brokers {
            manager
                .connect(spec)
                .await
                .map_err(|source| RelayError::Connect {
                    broker: spec.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Use `client` for broker `name` instead of an MQTT connection
    pub fn attach_client(
        &self,
        name: &str,
        client: Arc<dyn BrokerClient>,
    ) -> Result<(), BrokerError> {
        if !self.brokers.contains(name) {
            return Err(BrokerError::UnknownBroker(name.to_string()));
        }
        self.brokers.attach(name, client);
        Ok(())
    }

    /// Start the bindings and dispatch broker notices until shutdown.
    ///
    /// Returns `Ok(())` after [`Relay::shutdown`] or when every notice
    /// sender is gone, and [`RelayError::BrokerFatal`] when a broker fails
    /// unrecoverably. Bindings are stopped and brokers disconnected either
    /// way.
    pub async fn run(&self, mut notices: mpsc::Receiver<BrokerNotice>) -> Result<(), RelayError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Relay already running");
            return Ok(());
        }

        let mut shutdown = self.shutdown.subscribe();
        self.spawn_bindings();
        info!(
            "Relay started: {} brokers, {} bindings",
            self.topology.brokers.len(),
            self.bindings.len()
        );

        let result = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            tokio::select! {
                notice = notices.recv() => match notice {
                    Some(BrokerNotice::Status { broker, event }) => {
                        let transition = self.brokers.apply(&broker, &event);
                        if let Err(e) = self.on_transition(&broker, transition) {
                            break Err(e);
                        }
                    }
                    Some(BrokerNotice::Message(message)) => self.dispatch(message),
                    None => {
                        debug!("Broker notice channel closed");
                        break Ok(());
                    }
                },
                _ = shutdown.changed() => {}
            }
        };

        self.stop().await;
        result
    }

    /// Ask a running [`Relay::run`] to stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Reload a binding's script as if its file had changed.
    ///
    /// Returns false if the binding has no running actor.
    pub fn reload(&self, binding: &str) -> bool {
        self.handles
            .read()
            .get(binding)
            .is_some_and(|handle| handle.notify(BindingEvent::ScriptChanged))
    }

    fn spawn_bindings(&self) {
        let deps = BindingDeps {
            bindings: self.bindings.clone(),
            brokers: self.brokers.clone(),
            router: self.router.clone(),
            sandbox: self.sandbox.clone(),
            metrics: self.metrics.clone(),
            retry: RetryPolicy::from(&self.config.retry),
        };

        let mut handles = self.handles.write();
        let mut tasks = self.tasks.lock();

        for spec in self.specs.iter().filter(|s| s.active) {
            let (actor, handle) =
                BindingActor::new(spec.clone(), deps.clone(), self.config.engine.binding_queue);
            tasks.push(actor.spawn());

            if self.config.watch.enabled {
                if let ScriptSource::File(path) = &spec.script {
                    let watcher = ScriptWatcher::new(
                        spec.name.clone(),
                        path.clone(),
                        self.config.watch.interval,
                        handle.control(),
                    );
                    tasks.push(watcher.spawn(self.watch_stop.subscribe()));
                }
            }

            debug!(
                "Binding '{}': '{}' on {:?} -> '{}' on {:?}",
                spec.name, spec.from.topic, spec.from.brokers, spec.to.topic, spec.to.brokers
            );
            handles.insert(spec.name.clone(), handle);
        }
    }

    /// Apply a broker transition. Never waits on a binding, so broker
    /// notices keep draining while bindings are busy publishing.
    fn on_transition(&self, broker: &str, transition: BrokerTransition) -> Result<(), RelayError> {
        let event: fn(String) -> BindingEvent = match transition {
            BrokerTransition::Unchanged => return Ok(()),
            BrokerTransition::Up => {
                info!("Broker '{}': online", broker);
                self.metrics.set_broker_online(broker, true);
                BindingEvent::BrokerUp
            }
            BrokerTransition::Down => {
                warn!("Broker '{}': offline", broker);
                self.metrics.set_broker_online(broker, false);
                BindingEvent::BrokerDown
            }
            BrokerTransition::Fatal(message) => {
                error!("Broker '{}': fatal error: {}", broker, message);
                self.metrics.set_broker_online(broker, false);
                return Err(RelayError::BrokerFatal {
                    broker: broker.to_string(),
                    message,
                });
            }
        };

        let handles = self.handles.read();
        for spec in self.specs.iter().filter(|spec| spec.depends_on(broker)) {
            let Some(handle) = handles.get(&spec.name) else {
                continue;
            };
            if !handle.notify(event(broker.to_string())) {
                debug!("Binding '{}': stopped, skipping broker event", handle.name());
            }
        }
        Ok(())
    }

    fn dispatch(&self, message: InboundMessage) {
        let targets = self.router.route(&message.broker, &message.topic);
        if targets.is_empty() {
            debug!(
                "Broker '{}': no binding for '{}'",
                message.broker, message.topic
            );
            return;
        }

        let handles = self.handles.read();
        for name in targets {
            let Some(handle) = handles.get(&name) else {
                continue;
            };
            match handle.offer(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Binding '{}': queue full, dropping message on '{}'",
                        name, message.topic
                    );
                    self.metrics.message_dropped(&name);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Binding '{}': stopped, dropping message", name);
                }
            }
        }
    }

    async fn stop(&self) {
        info!("Relay shutting down");

        let handles: Vec<BindingHandle> = self.handles.write().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.notify(BindingEvent::Shutdown);
        }
        let _ = self.watch_stop.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Task did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                task.abort();
            }
        }

        self.brokers.disconnect_all().await;
        for spec in &self.topology.brokers {
            self.metrics.set_broker_online(&spec.name, false);
        }
        info!("Relay stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    pub fn brokers(&self) -> &Arc<BrokerRegistry> {
        &self.brokers
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn binding_status(&self, name: &str) -> Option<BindingStatus> {
        self.bindings.status(name)
    }

    pub fn binding_error(&self, name: &str) -> Option<String> {
        self.bindings.error(name)
    }

    pub fn broker_status(&self, name: &str) -> Option<BrokerStatus> {
        self.brokers.status(name)
    }

    pub fn binding_snapshot(&self) -> Vec<BindingSnapshot> {
        self.bindings.snapshot()
    }

    pub fn broker_snapshot(&self) -> Vec<(String, BrokerStatus)> {
        self.brokers.snapshot()
    }
}
