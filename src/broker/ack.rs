//! Acknowledgement tracking for MQTT requests
//!
//! rumqttc does not hand out packet ids when a request is queued; it
//! reports them later as outgoing events, in request order. Callers
//! register a waiter before queuing a request, the event loop pairs the
//! oldest waiter of that kind with the packet id it sees go out, and the
//! matching SUBACK, PUBACK or PUBCOMP completes it.
//!
//! When the connection drops, every open waiter fails. Requests still in
//! the client's queue keep a placeholder so their later outgoing events
//! do not complete somebody else's waiter, and publishes the client will
//! retransmit are remembered so their packet ids are skipped once.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::BrokerError;

pub(crate) type AckResult = Result<(), BrokerError>;

type Waiter = oneshot::Sender<AckResult>;

#[derive(Default)]
struct AckState {
    /// Queued subscribes, oldest first; `None` for abandoned requests
    queued_subscribes: VecDeque<Option<Waiter>>,
    /// Queued publishes with their QoS, oldest first
    queued_publishes: VecDeque<(u8, Option<Waiter>)>,
    subscribes: HashMap<u16, Waiter>,
    publishes: HashMap<u16, Waiter>,
    /// In-flight publishes failed by a disconnect that will be resent
    retransmits: HashSet<u16>,
}

#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscribe about to be queued
    pub fn expect_subscribe(&self) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().queued_subscribes.push_back(Some(tx));
        rx
    }

    /// Register a publish about to be queued
    pub fn expect_publish(&self, qos: u8) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().queued_publishes.push_back((qos, Some(tx)));
        rx
    }

    /// The most recent subscribe never reached the client's queue
    pub fn withdraw_subscribe(&self) {
        self.state.lock().queued_subscribes.pop_back();
    }

    /// The most recent publish never reached the client's queue
    pub fn withdraw_publish(&self) {
        self.state.lock().queued_publishes.pop_back();
    }

    /// A SUBSCRIBE with `pkid` went out
    pub fn subscribe_sent(&self, pkid: u16) {
        let mut state = self.state.lock();
        if let Some(Some(waiter)) = state.queued_subscribes.pop_front() {
            state.subscribes.insert(pkid, waiter);
        }
    }

    /// A PUBLISH with `pkid` went out; QoS 0 completes immediately
    pub fn publish_sent(&self, pkid: u16) {
        let mut state = self.state.lock();
        if pkid != 0 && state.retransmits.remove(&pkid) {
            return;
        }
        match state.queued_publishes.pop_front() {
            Some((0, Some(waiter))) => {
                let _ = waiter.send(Ok(()));
            }
            Some((_, Some(waiter))) => {
                state.publishes.insert(pkid, waiter);
            }
            _ => {}
        }
    }

    /// SUBACK for `pkid`; `granted` is false if any filter was refused
    pub fn subscribe_acked(&self, pkid: u16, granted: bool) {
        if let Some(waiter) = self.state.lock().subscribes.remove(&pkid) {
            let result = if granted {
                Ok(())
            } else {
                Err(BrokerError::Client("subscription refused by broker".into()))
            };
            let _ = waiter.send(result);
        }
    }

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2) for `pkid`
    pub fn publish_acked(&self, pkid: u16) {
        if let Some(waiter) = self.state.lock().publishes.remove(&pkid) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Fail every open waiter
    pub fn fail_all(&self, reason: &str) {
        let mut state = self.state.lock();
        let error = || Err(BrokerError::Client(reason.to_string()));

        for slot in state.queued_subscribes.iter_mut() {
            if let Some(waiter) = slot.take() {
                let _ = waiter.send(error());
            }
        }
        for (_, slot) in state.queued_publishes.iter_mut() {
            if let Some(waiter) = slot.take() {
                let _ = waiter.send(error());
            }
        }
        for (_, waiter) in state.subscribes.drain() {
            let _ = waiter.send(error());
        }
        let in_flight: Vec<(u16, Waiter)> = state.publishes.drain().collect();
        for (pkid, waiter) in in_flight {
            state.retransmits.insert(pkid);
            let _ = waiter.send(error());
        }
    }

    /// Forget everything, for a client that will never send again
    pub fn close(&self, reason: &str) {
        self.fail_all(reason);
        let mut state = self.state.lock();
        state.queued_subscribes.clear();
        state.queued_publishes.clear();
        state.retransmits.clear();
    }

    #[cfg(test)]
    pub fn open(&self) -> usize {
        let state = self.state.lock();
        state.subscribes.len() + state.publishes.len()
    }
}
