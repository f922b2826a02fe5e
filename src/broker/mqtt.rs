//! MQTT client connection backed by rumqttc
//!
//! The rumqttc event loop runs in its own task and is translated into
//! [`BrokerNotice`]s. rumqttc reconnects on the next poll after an error, so
//! the reconnect interval is the sleep between a failed poll and the next.
//!
//! `subscribe` and `publish` return once the broker has acknowledged the
//! request (SUBACK, PUBACK or PUBCOMP; QoS 0 publishes once written), or
//! with an error when the connection drops first or the broker refuses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ack::{AckResult, AckTracker};
use super::{
    parse_broker_url, BrokerClient, BrokerError, BrokerEvent, BrokerNotice, BrokerSpec,
    ConnectError,
};
use crate::message::InboundMessage;

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 64;

/// rumqttc rejects keepalives below this
const MIN_KEEPALIVE: Duration = Duration::from_secs(5);

/// How long `disconnect` waits for the event loop to flush
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// How long a request may wait for its acknowledgement
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// A connection to one MQTT broker
pub struct MqttClient {
    name: String,
    client: AsyncClient,
    acks: Arc<AckTracker>,
    /// Keeps waiter registration in the same order as the client queue
    requests: tokio::sync::Mutex<()>,
    online: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Validate the URL, resolve the host and start the event loop.
    ///
    /// The broker session itself is established asynchronously; its
    /// outcome arrives as a [`BrokerEvent`] on `notices`.
    pub async fn connect(
        spec: &BrokerSpec,
        notices: mpsc::Sender<BrokerNotice>,
    ) -> Result<Self, ConnectError> {
        let (host, port) = parse_broker_url(&spec.url)?;

        let resolved = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        if !resolved {
            return Err(ConnectError::Unresolvable(host));
        }

        let mut options = MqttOptions::new(spec.client_id.clone(), host, port);
        options.set_keep_alive(spec.keepalive.max(MIN_KEEPALIVE));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let acks = Arc::new(AckTracker::new());
        let online = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(event_loop(
            spec.name.clone(),
            eventloop,
            spec.reconnect,
            notices,
            acks.clone(),
            online.clone(),
            stopping.clone(),
        ));

        Ok(Self {
            name: spec.name.clone(),
            client,
            acks,
            requests: tokio::sync::Mutex::new(()),
            online,
            stopping,
            task: Mutex::new(Some(task)),
        })
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected(self.name.clone()))
        }
    }

    async fn acknowledged(&self, ack: oneshot::Receiver<AckResult>) -> Result<(), BrokerError> {
        match tokio::time::timeout(ACK_TIMEOUT, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::NotConnected(self.name.clone())),
            Err(_) => Err(BrokerError::Client(format!(
                "no acknowledgement within {:?}",
                ACK_TIMEOUT
            ))),
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn subscribe(&self, filter: &str, qos: u8) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let ack = {
            let _order = self.requests.lock().await;
            let ack = self.acks.expect_subscribe();
            if let Err(e) = self.client.subscribe(filter, qos_from_u8(qos)).await {
                self.acks.withdraw_subscribe();
                return Err(BrokerError::Client(e.to_string()));
            }
            ack
        };
        self.acknowledged(ack).await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.ensure_online()?;
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: u8) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let qos = qos_from_u8(qos);
        let ack = {
            let _order = self.requests.lock().await;
            let ack = self.acks.expect_publish(qos as u8);
            if let Err(e) = self.client.publish_bytes(topic, qos, false, payload).await {
                self.acks.withdraw_publish();
                return Err(BrokerError::Client(e.to_string()));
            }
            ack
        };
        self.acknowledged(ack).await
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.stopping.store(true, Ordering::Release);
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Client(e.to_string()));

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.online.store(false, Ordering::Release);
        self.acks.close("client disconnected");
        result
    }
}

async fn event_loop(
    name: String,
    mut eventloop: EventLoop,
    reconnect: Option<Duration>,
    notices: mpsc::Sender<BrokerNotice>,
    acks: Arc<AckTracker>,
    online: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
) {
    let notify = |event: BrokerEvent| {
        let notices = notices.clone();
        let name = name.clone();
        async move { notices.send(BrokerNotice::status(name, event)).await.is_ok() }
    };

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("Broker '{}': session established", name);
                online.store(true, Ordering::Release);
                if !notify(BrokerEvent::Connected).await {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(name.clone(), publish.topic, publish.payload);
                if notices.send(BrokerNotice::Message(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => acks.subscribe_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.publish_sent(pkid),
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let granted = suback
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                if !granted {
                    warn!("Broker '{}': subscription {} refused", name, suback.pkid);
                }
                acks.subscribe_acked(suback.pkid, granted);
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => acks.publish_acked(puback.pkid),
            Ok(Event::Incoming(Packet::PubComp(pubcomp))) => acks.publish_acked(pubcomp.pkid),
            Ok(_) => {}
            Err(_) if stopping.load(Ordering::Acquire) => break,
            Err(ConnectionError::ConnectionRefused(code)) => {
                online.store(false, Ordering::Release);
                let _ = notify(BrokerEvent::FatalError(format!(
                    "connection refused: {:?}",
                    code
                )))
                .await;
                break;
            }
            Err(e) => {
                acks.fail_all("connection lost");
                let was_online = online.swap(false, Ordering::AcqRel);
                if was_online {
                    warn!("Broker '{}': connection lost: {}", name, e);
                    if !notify(BrokerEvent::Disconnected).await {
                        break;
                    }
                } else {
                    debug!("Broker '{}': connect failed: {}", name, e);
                }

                match reconnect {
                    Some(delay) => {
                        if was_online && !notify(BrokerEvent::WentOffline).await {
                            break;
                        }
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        info!("Broker '{}': reconnect disabled, going offline", name);
                        let _ = notify(BrokerEvent::WentOffline).await;
                        break;
                    }
                }
            }
        }
    }

    acks.close("connection closed");
    debug!("Broker '{}': event loop stopped", name);
}
