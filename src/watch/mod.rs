//! Script file watching
//!
//! Polls a binding's script file and sends [`BindingEvent::ScriptChanged`]
//! when its modification time or size changes. A file that disappears is
//! not a change; its reappearance is.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::binding::BindingEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

async fn fingerprint(path: &PathBuf) -> Option<Fingerprint> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(Fingerprint {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

pub struct ScriptWatcher {
    binding: String,
    path: PathBuf,
    interval: Duration,
    events: mpsc::UnboundedSender<BindingEvent>,
}

impl ScriptWatcher {
    pub fn new(
        binding: impl Into<String>,
        path: PathBuf,
        interval: Duration,
        events: mpsc::UnboundedSender<BindingEvent>,
    ) -> Self {
        Self {
            binding: binding.into(),
            path,
            interval,
            events,
        }
    }

    /// Start polling until shutdown or the binding's queue closes
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut last = fingerprint(&self.path).await;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => break,
            }

            let current = fingerprint(&self.path).await;
            if current.is_none() || current == last {
                continue;
            }
            last = current;

            debug!(
                "Binding '{}': script {} changed",
                self.binding,
                self.path.display()
            );
            if self.events.send(BindingEvent::ScriptChanged).is_err() {
                break;
            }
        }

        debug!("Binding '{}': watcher stopped", self.binding);
    }
}
