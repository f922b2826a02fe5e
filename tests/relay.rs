//! Integration Tests for the Relay
//!
//! These tests drive a full `Relay` with in-memory broker clients: broker
//! notices are fed through the same channel real MQTT connections use, and
//! every subscribe/publish the relay makes is recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vibemq_relay::broker::BrokerEvent;
use vibemq_relay::{
    BindingStatus, BrokerClient, BrokerError, BrokerNotice, Config, InboundMessage, Relay,
    RelayError,
};

const SCRIPTS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/scripts");

/// Records every call the relay makes on a broker
#[derive(Default)]
struct MockBroker {
    calls: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Bytes)>>,
    /// Subscribes to refuse before accepting again
    refuse_subscribes: AtomicUsize,
    subscribe_attempts: AtomicUsize,
    /// Publishes started, including ones still waiting out the delay
    publishing: AtomicUsize,
    publish_delay: Mutex<Duration>,
}

impl MockBroker {
    fn refuse_next_subscribes(&self, count: usize) {
        self.refuse_subscribes.store(count, Ordering::SeqCst);
    }

    fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    fn publishing(&self) -> usize {
        self.publishing.load(Ordering::SeqCst)
    }

    fn slow_publishes(&self, delay: Duration) {
        *self.publish_delay.lock() = delay;
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn subscribe(&self, filter: &str, _qos: u8) -> Result<(), BrokerError> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Client("subscription refused by broker".into()));
        }
        self.calls.lock().push(format!("sub {}", filter));
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.calls.lock().push(format!("unsub {}", filter));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes, _qos: u8) -> Result<(), BrokerError> {
        self.publishing.fetch_add(1, Ordering::SeqCst);
        let delay = *self.publish_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.calls.lock().push("disconnect".to_string());
        Ok(())
    }
}

struct Harness {
    relay: Arc<Relay>,
    notices: mpsc::Sender<BrokerNotice>,
    brokers: HashMap<String, Arc<MockBroker>>,
    task: JoinHandle<Result<(), RelayError>>,
}

impl Harness {
    fn start(bindings: &str) -> Self {
        Self::start_in(SCRIPTS, bindings)
    }

    fn start_in(root: &str, bindings: &str) -> Self {
        Self::start_with_retry(root, "20ms", bindings)
    }

    fn start_with_retry(root: &str, initial: &str, bindings: &str) -> Self {
        let toml = format!(
            r#"
bindings_root = "{root}"

[watch]
enabled = false

[retry]
initial = "{initial}"
max = "1s"

[[brokers]]
name = "local"
url = "mqtt://localhost:1883"

[[brokers]]
name = "cloud"
url = "mqtt://cloud.example.com:1883"

{bindings}
"#
        );
        Self::with_config(Config::parse(&toml).unwrap())
    }

    fn with_config(config: Config) -> Self {
        let relay = Arc::new(Relay::new(config).unwrap());
        let mut brokers = HashMap::new();
        for name in ["local", "cloud"] {
            let mock = Arc::new(MockBroker::default());
            relay.attach_client(name, mock.clone()).unwrap();
            brokers.insert(name.to_string(), mock);
        }

        let (notices, rx) = mpsc::channel(64);
        let runner = relay.clone();
        let task = tokio::spawn(async move { runner.run(rx).await });

        Self {
            relay,
            notices,
            brokers,
            task,
        }
    }

    fn broker(&self, name: &str) -> &MockBroker {
        &self.brokers[name]
    }

    async fn event(&self, broker: &str, event: BrokerEvent) {
        self.notices
            .send(BrokerNotice::status(broker, event))
            .await
            .unwrap();
    }

    async fn all_up(&self) {
        self.event("local", BrokerEvent::Connected).await;
        self.event("cloud", BrokerEvent::Connected).await;
    }

    async fn message(&self, broker: &str, topic: &str, payload: &'static [u8]) {
        let message = InboundMessage::new(broker, topic, Bytes::from_static(payload));
        self.notices
            .send(BrokerNotice::Message(message))
            .await
            .unwrap();
    }

    async fn wait_status(&self, binding: &str, status: BindingStatus) {
        let relay = self.relay.clone();
        let name = binding.to_string();
        wait_until(move || relay.binding_status(&name) == Some(status)).await;
    }

    async fn stop(self) -> Result<(), RelayError> {
        self.relay.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("relay did not stop")
            .unwrap()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

const IDENTITY: &str = r#"
[[bindings]]
name = "temps"
path = "identity.wat"
from = { broker = "local", topic = "sensors/+/temp" }
to = { broker = "cloud", topic = "sensors/+/out" }
"#;

#[tokio::test]
async fn test_identity_republishes_each_message_once() {
    let h = Harness::start(IDENTITY);
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;
    assert_eq!(h.broker("local").calls(), vec!["sub sensors/+/temp"]);

    h.message("local", "sensors/kitchen/temp", b"21.5").await;
    h.message("local", "sensors/hall/humidity", b"40").await;
    h.message("local", "sensors/attic/temp", b"18").await;

    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.published().len() == 2).await;
    assert_eq!(
        h.broker("cloud").published(),
        vec![
            ("sensors/kitchen/out".to_string(), Bytes::from_static(b"21.5")),
            ("sensors/attic/out".to_string(), Bytes::from_static(b"18")),
        ]
    );
    assert!(h.broker("local").published().is_empty());

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_binding_waits_for_every_broker() {
    let h = Harness::start(IDENTITY);
    h.wait_status("temps", BindingStatus::Offline).await;

    h.event("local", BrokerEvent::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.relay.binding_status("temps"), Some(BindingStatus::Offline));
    assert!(h.broker("local").calls().is_empty());

    h.event("cloud", BrokerEvent::Connected).await;
    h.wait_status("temps", BindingStatus::Online).await;

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_runtime_error_does_not_block_next_message() {
    let h = Harness::start(
        r##"
[[bindings]]
name = "picky"
path = "picky.wat"
from = { broker = "local", topic = "in/#" }
to = { broker = "cloud", topic = "#" }
"##,
    );
    h.all_up().await;
    h.wait_status("picky", BindingStatus::Online).await;

    h.message("local", "in/a", b"").await;
    h.message("local", "in/b", b"ok").await;

    let cloud = h.brokers["cloud"].clone();
    wait_until(move || !cloud.published().is_empty()).await;
    assert_eq!(
        h.broker("cloud").published(),
        vec![("in/b".to_string(), Bytes::from_static(b"ok"))]
    );
    assert_eq!(h.relay.binding_status("picky"), Some(BindingStatus::Online));
    assert_eq!(
        h.relay
            .metrics()
            .script_errors
            .with_label_values(&["picky"])
            .get(),
        1
    );

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_messages_run_one_at_a_time_in_order() {
    let h = Harness::start(
        r##"
[[bindings]]
name = "count"
path = "counter.wat"
from = { broker = "local", topic = "tick" }
to = { broker = "cloud", topic = "#" }
"##,
    );
    h.all_up().await;
    h.wait_status("count", BindingStatus::Online).await;

    for _ in 0..5 {
        h.message("local", "tick", b"x").await;
    }

    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.published().len() == 5).await;
    let counts: Vec<i32> = h
        .broker("cloud")
        .published()
        .iter()
        .map(|(_, payload)| i32::from_le_bytes(payload[..4].try_into().unwrap()))
        .collect();
    assert_eq!(counts, vec![1, 2, 3, 4, 5]);

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_reload_switches_to_new_script() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("live.wat");
    std::fs::copy(format!("{}/identity.wat", SCRIPTS), &script).unwrap();

    let h = Harness::start_in(
        dir.path().to_str().unwrap(),
        r#"
[[bindings]]
name = "live"
path = "live.wat"
from = { broker = "local", topic = "in" }
to = { broker = "cloud", topic = "out" }
"#,
    );
    h.all_up().await;
    h.wait_status("live", BindingStatus::Online).await;

    h.message("local", "in", b"first").await;
    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.published().len() == 1).await;

    std::fs::copy(format!("{}/counter.wat", SCRIPTS), &script).unwrap();
    assert!(h.relay.reload("live"));

    let relay = h.relay.clone();
    wait_until(move || relay.metrics().reloads.with_label_values(&["live"]).get() == 1).await;
    h.wait_status("live", BindingStatus::Online).await;

    h.message("local", "in", b"second").await;
    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.published().len() == 2).await;
    assert_eq!(
        h.broker("cloud").published()[1],
        ("out".to_string(), Bytes::from(1i32.to_le_bytes().to_vec()))
    );

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_reload_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("live.wat");
    std::fs::copy(format!("{}/identity.wat", SCRIPTS), &script).unwrap();

    let h = Harness::start_in(
        dir.path().to_str().unwrap(),
        r#"
[[bindings]]
name = "live"
path = "live.wat"
from = { broker = "local", topic = "in" }
to = { broker = "cloud", topic = "out" }
"#,
    );
    h.all_up().await;
    h.wait_status("live", BindingStatus::Online).await;

    std::fs::write(&script, "(module (func").unwrap();
    assert!(h.relay.reload("live"));
    h.wait_status("live", BindingStatus::Error).await;
    assert!(h
        .relay
        .binding_error("live")
        .unwrap()
        .starts_with("reload failed"));
    assert_eq!(h.broker("local").calls(), vec!["sub in", "unsub in"]);

    std::fs::copy(format!("{}/identity.wat", SCRIPTS), &script).unwrap();
    assert!(h.relay.reload("live"));
    h.wait_status("live", BindingStatus::Online).await;
    assert_eq!(h.relay.binding_error("live"), None);

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_watched_script_change_triggers_reload() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("live.wat");
    std::fs::copy(format!("{}/identity.wat", SCRIPTS), &script).unwrap();

    let toml = format!(
        r#"
bindings_root = "{}"

[watch]
enabled = true
interval = "20ms"

[[brokers]]
name = "local"
url = "mqtt://localhost"

[[brokers]]
name = "cloud"
url = "mqtt://cloud.example.com"

[[bindings]]
name = "live"
path = "live.wat"
from = {{ broker = "local", topic = "in" }}
to = {{ broker = "cloud", topic = "out" }}
"#,
        dir.path().display()
    );
    let h = Harness::with_config(Config::parse(&toml).unwrap());
    h.all_up().await;
    h.wait_status("live", BindingStatus::Online).await;

    std::fs::copy(format!("{}/counter.wat", SCRIPTS), &script).unwrap();
    let relay = h.relay.clone();
    wait_until(move || relay.metrics().reloads.with_label_values(&["live"]).get() == 1).await;
    h.wait_status("live", BindingStatus::Online).await;

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_down_stops_routing() {
    let h = Harness::start(IDENTITY);
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;

    h.event("cloud", BrokerEvent::Disconnected).await;
    h.event("cloud", BrokerEvent::WentOffline).await;
    h.wait_status("temps", BindingStatus::Offline).await;
    assert_eq!(
        h.broker("local").calls(),
        vec!["sub sensors/+/temp", "unsub sensors/+/temp"]
    );

    h.message("local", "sensors/kitchen/temp", b"21").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.broker("cloud").published().is_empty());
    assert_eq!(
        h.relay
            .metrics()
            .messages_received
            .with_label_values(&["temps"])
            .get(),
        0
    );

    h.event("cloud", BrokerEvent::Connected).await;
    h.wait_status("temps", BindingStatus::Online).await;
    h.message("local", "sensors/kitchen/temp", b"22").await;
    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.published().len() == 1).await;

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_broker_binding_is_rejected() {
    let h = Harness::start(
        r#"
[[bindings]]
name = "lost"
from = { broker = "local", topic = "a" }
to = { broker = "nowhere", topic = "b" }

[[bindings]]
name = "lost-quiet"
active = false
to = { broker = "nowhere" }
"#,
    );
    assert_eq!(h.relay.binding_status("lost"), Some(BindingStatus::Error));
    assert_eq!(
        h.relay.binding_error("lost").as_deref(),
        Some("unknown broker 'nowhere'")
    );
    assert_eq!(
        h.relay.binding_status("lost-quiet"),
        Some(BindingStatus::Inactive)
    );

    h.all_up().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.relay.binding_status("lost"), Some(BindingStatus::Error));
    assert!(h.broker("local").calls().is_empty());

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_inactive_binding_never_starts() {
    let h = Harness::start(
        r#"
[[bindings]]
name = "off"
active = false
from = { broker = "local", topic = "a" }
to = { broker = "cloud", topic = "b" }
"#,
    );
    h.all_up().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.relay.binding_status("off"), Some(BindingStatus::Inactive));
    assert!(!h.relay.reload("off"));
    assert!(h.broker("local").calls().is_empty());

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_load_error_isolated_to_binding() {
    let h = Harness::start(
        r#"
[[bindings]]
name = "broken"
path = "no_handler.wat"
from = { broker = "local", topic = "x" }
to = { broker = "cloud" }

[[bindings]]
name = "fine"
from = { broker = "local", topic = "y" }
to = { broker = "cloud" }
"#,
    );
    h.all_up().await;
    h.wait_status("broken", BindingStatus::Error).await;
    h.wait_status("fine", BindingStatus::Online).await;
    assert!(h.relay.binding_error("broken").is_some());

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_broker_error_ends_run() {
    let h = Harness::start(IDENTITY);
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;

    h.event("cloud", BrokerEvent::FatalError("not authorized".into()))
        .await;
    let result = tokio::time::timeout(Duration::from_secs(10), h.task)
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(RelayError::BrokerFatal { broker, message }) => {
            assert_eq!(broker, "cloud");
            assert_eq!(message, "not authorized");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(
        h.brokers["local"].calls().last().map(String::as_str),
        Some("disconnect")
    );
}

#[tokio::test]
async fn test_shutdown_unsubscribes_and_disconnects() {
    let h = Harness::start(IDENTITY);
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;

    let local = h.brokers["local"].clone();
    let cloud = h.brokers["cloud"].clone();
    h.stop().await.unwrap();

    assert_eq!(
        local.calls(),
        vec!["sub sensors/+/temp", "unsub sensors/+/temp", "disconnect"]
    );
    assert_eq!(cloud.calls(), vec!["disconnect"]);
}

#[tokio::test]
async fn test_queued_messages_stop_when_broker_goes_offline() {
    let h = Harness::start(IDENTITY);
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;
    h.broker("cloud").slow_publishes(Duration::from_millis(200));

    for _ in 0..5 {
        h.message("local", "sensors/kitchen/temp", b"21").await;
    }
    h.event("cloud", BrokerEvent::Disconnected).await;
    h.event("cloud", BrokerEvent::WentOffline).await;
    h.wait_status("temps", BindingStatus::Offline).await;

    let metrics = h.relay.metrics().clone();
    wait_until(move || {
        let received = metrics.messages_received.with_label_values(&["temps"]).get();
        let dropped = metrics.messages_dropped.with_label_values(&["temps"]).get();
        received + dropped == 5
    })
    .await;

    let received = h
        .relay
        .metrics()
        .messages_received
        .with_label_values(&["temps"])
        .get();
    assert!(received <= 1, "{} messages ran after going offline", received);
    assert!(h.broker("cloud").published().len() <= 1);

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_refused_subscribe_is_retried_until_online() {
    let h = Harness::start(IDENTITY);
    h.broker("local").refuse_next_subscribes(2);
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;

    assert_eq!(h.broker("local").subscribe_attempts(), 3);
    assert_eq!(h.broker("local").calls(), vec!["sub sensors/+/temp"]);
    assert_eq!(
        h.relay.metrics().retries.with_label_values(&["temps"]).get(),
        2
    );

    // One retry per failure, and none once online
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.broker("local").subscribe_attempts(), 3);
    assert_eq!(
        h.relay.metrics().retries.with_label_values(&["temps"]).get(),
        2
    );

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_broker_down_cancels_pending_retry() {
    let h = Harness::start_with_retry(SCRIPTS, "200ms", IDENTITY);
    h.broker("local").refuse_next_subscribes(1);
    h.all_up().await;

    let local = h.brokers["local"].clone();
    wait_until(move || local.subscribe_attempts() == 1).await;
    h.wait_status("temps", BindingStatus::Offline).await;

    h.event("cloud", BrokerEvent::Disconnected).await;
    h.event("cloud", BrokerEvent::WentOffline).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.broker("local").subscribe_attempts(), 1);
    assert_eq!(h.relay.binding_status("temps"), Some(BindingStatus::Offline));

    h.event("cloud", BrokerEvent::Connected).await;
    h.wait_status("temps", BindingStatus::Online).await;
    assert_eq!(h.broker("local").subscribe_attempts(), 2);

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_reload_waits_for_message_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("live.wat");
    std::fs::copy(format!("{}/identity.wat", SCRIPTS), &script).unwrap();

    let h = Harness::start_in(
        dir.path().to_str().unwrap(),
        r#"
[[bindings]]
name = "live"
path = "live.wat"
from = { broker = "local", topic = "in" }
to = { broker = "cloud", topic = "out" }
"#,
    );
    h.all_up().await;
    h.wait_status("live", BindingStatus::Online).await;
    h.broker("cloud").slow_publishes(Duration::from_millis(300));

    h.message("local", "in", b"first").await;
    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.publishing() == 1).await;

    std::fs::copy(format!("{}/counter.wat", SCRIPTS), &script).unwrap();
    assert!(h.relay.reload("live"));
    h.message("local", "in", b"second").await;

    let cloud = h.brokers["cloud"].clone();
    wait_until(move || cloud.published().len() == 2).await;
    assert_eq!(
        h.broker("cloud").published(),
        vec![
            ("out".to_string(), Bytes::from_static(b"first")),
            ("out".to_string(), Bytes::from(1i32.to_le_bytes().to_vec())),
        ]
    );
    assert_eq!(
        h.relay.metrics().reloads.with_label_values(&["live"]).get(),
        1
    );

    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_binding_queue_does_not_stall_broker_events() {
    let toml = format!(
        r#"
bindings_root = "{SCRIPTS}"

[engine]
binding_queue = 1

[watch]
enabled = false

[[brokers]]
name = "local"
url = "mqtt://localhost:1883"

[[brokers]]
name = "cloud"
url = "mqtt://cloud.example.com:1883"

{IDENTITY}
"#
    );
    let h = Harness::with_config(Config::parse(&toml).unwrap());
    h.all_up().await;
    h.wait_status("temps", BindingStatus::Online).await;
    h.broker("cloud").slow_publishes(Duration::from_millis(500));

    for _ in 0..10 {
        h.message("local", "sensors/kitchen/temp", b"21").await;
    }
    h.event("cloud", BrokerEvent::Disconnected).await;
    h.event("cloud", BrokerEvent::WentOffline).await;
    h.wait_status("temps", BindingStatus::Offline).await;

    assert!(
        h.relay
            .metrics()
            .messages_dropped
            .with_label_values(&["temps"])
            .get()
            >= 8
    );

    h.stop().await.unwrap();
}
