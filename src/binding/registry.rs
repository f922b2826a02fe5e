//! Binding Registry
//!
//! Name to status map shared by the actors, the relay and the metrics
//! endpoint. Every status change goes through [`BindingRegistry::transition`]
//! or [`BindingRegistry::fail`], which reject illegal edges atomically.

use std::fmt;
use std::time::Instant;

use dashmap::DashMap;

use super::BindingStatus;

/// Attempted an edge the state machine does not have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub binding: String,
    /// Status at the time; `None` when the binding is not registered
    pub from: Option<BindingStatus>,
    pub to: BindingStatus,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from {
            Some(from) => write!(
                f,
                "binding '{}': illegal transition {} -> {}",
                self.binding, from, self.to
            ),
            None => write!(f, "binding '{}' is not registered", self.binding),
        }
    }
}

impl std::error::Error for TransitionError {}

struct BindingEntry {
    status: BindingStatus,
    error: Option<String>,
    since: Instant,
}

/// Point-in-time view of one binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub name: String,
    pub status: BindingStatus,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct BindingRegistry {
    entries: DashMap<String, BindingEntry>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding that will be driven by an actor.
    ///
    /// Starts in `Loading`, or `Inactive` when `active` is false.
    pub fn register(&self, name: &str, active: bool) -> BindingStatus {
        let status = if active {
            BindingStatus::Loading
        } else {
            BindingStatus::Inactive
        };
        self.insert(name, status, None);
        status
    }

    /// Register a binding that failed validation; it never gets an actor.
    pub fn register_rejected(&self, name: &str, reason: &str, active: bool) -> BindingStatus {
        if active {
            self.insert(name, BindingStatus::Error, Some(reason.to_string()));
            BindingStatus::Error
        } else {
            self.insert(name, BindingStatus::Inactive, None);
            BindingStatus::Inactive
        }
    }

    fn insert(&self, name: &str, status: BindingStatus, error: Option<String>) {
        self.entries.insert(
            name.to_string(),
            BindingEntry {
                status,
                error,
                since: Instant::now(),
            },
        );
    }

    /// Move a binding to `next`, clearing any error message.
    ///
    /// Returns the previous status.
    pub fn transition(
        &self,
        name: &str,
        next: BindingStatus,
    ) -> Result<BindingStatus, TransitionError> {
        self.update(name, next, None)
    }

    /// Move a binding to `Error` with a message.
    pub fn fail(&self, name: &str, message: String) -> Result<BindingStatus, TransitionError> {
        self.update(name, BindingStatus::Error, Some(message))
    }

    fn update(
        &self,
        name: &str,
        next: BindingStatus,
        error: Option<String>,
    ) -> Result<BindingStatus, TransitionError> {
        let mut entry = self.entries.get_mut(name).ok_or_else(|| TransitionError {
            binding: name.to_string(),
            from: None,
            to: next,
        })?;

        let previous = entry.status;
        if !previous.can_transition_to(next) {
            return Err(TransitionError {
                binding: name.to_string(),
                from: Some(previous),
                to: next,
            });
        }

        entry.status = next;
        entry.error = error;
        entry.since = Instant::now();
        Ok(previous)
    }

    pub fn status(&self, name: &str) -> Option<BindingStatus> {
        self.entries.get(name).map(|e| e.status)
    }

    /// Error message; only ever set while in `Error`
    pub fn error(&self, name: &str) -> Option<String> {
        self.entries.get(name).and_then(|e| e.error.clone())
    }

    /// Time spent in the current status
    pub fn status_age(&self, name: &str) -> Option<std::time::Duration> {
        self.entries.get(name).map(|e| e.since.elapsed())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All bindings sorted by name
    pub fn snapshot(&self) -> Vec<BindingSnapshot> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| BindingSnapshot {
                name: e.key().clone(),
                status: e.status,
                error: e.error.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Whether every binding that is not `Inactive` is `Online`
    pub fn all_routing(&self) -> bool {
        self.entries.iter().all(|e| {
            matches!(e.status, BindingStatus::Inactive | BindingStatus::Online)
        })
    }
}
