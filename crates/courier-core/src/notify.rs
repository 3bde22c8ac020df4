//! Change notifications
//!
//! Applications register a [`ChangeSubscriber`] (or take a channel) and get a
//! [`Subscription`] handle back. Dropping or cancelling the handle unregisters
//! the subscriber.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use courier_storage_traits::messages::types::{MessageKey, MessageRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// New record appended
    Inserted,
    /// Edit applied
    Edited,
    /// Record tombstoned
    Deleted,
}

impl ChangeKind {
    /// Get as `&str`
    pub fn as_str(&self) -> &str {
        match self {
            Self::Inserted => "inserted",
            Self::Edited => "edited",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One applied mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Key of the mutated record
    pub key: MessageKey,
    /// Mutation type
    pub kind: ChangeKind,
    /// Record state after the mutation
    pub record: MessageRecord,
}

/// Receiver of change notifications.
///
/// Delivery is at-least-once from the subscriber's point of view: handle
/// repeats idempotently on `(key, record.revision)`. Calls for one key arrive in
/// mutation order; calls for different keys may arrive concurrently.
///
/// `on_change` runs while the pipeline holds the lock for the changed key, and
/// that lock is not re-entrant. Calling back into the pipeline for the same key
/// from inside `on_change` deadlocks. Keep the callback short, or hand the
/// change off to another thread (see
/// [`Notifier::subscribe_channel`]).
pub trait ChangeSubscriber: Send + Sync + fmt::Debug {
    /// Called once per applied mutation
    fn on_change(&self, change: &Change);
}

/// Forwards changes into an unbounded tokio channel
#[derive(Debug)]
struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<Change>,
}

impl ChangeSubscriber for ChannelSubscriber {
    fn on_change(&self, change: &Change) {
        if self.sender.send(change.clone()).is_err() {
            tracing::debug!(
                target: "courier_core::notify::channel",
                "Change receiver dropped, discarding {} for {}",
                change.kind,
                change.key
            );
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Arc<dyn ChangeSubscriber>)>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.subscribers.write().retain(|(sid, _)| *sid != id);
    }
}

/// Fan-out point for change notifications
#[derive(Clone, Default)]
pub struct Notifier {
    registry: Arc<Registry>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Notifier {
    /// Notifier without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber` until the returned handle is cancelled or dropped
    pub fn subscribe(&self, subscriber: Arc<dyn ChangeSubscriber>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.subscribers.write().push((id, subscriber));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Register a channel and return its receiving end
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Change>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.subscribe(Arc::new(ChannelSubscriber { sender }));
        (subscription, receiver)
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.read().len()
    }

    /// Deliver `change` to every subscriber.
    ///
    /// Subscribers are called outside the registry lock, so a subscriber may
    /// subscribe or unsubscribe from inside its callback.
    pub fn notify(&self, change: &Change) {
        let subscribers: Vec<Arc<dyn ChangeSubscriber>> = self
            .registry
            .subscribers
            .read()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        for subscriber in subscribers {
            subscriber.on_change(change);
        }
    }
}

/// Registration handle returned by [`Notifier::subscribe`].
///
/// Unregisters on [`Subscription::cancel`] or drop.
#[must_use = "dropping a Subscription unregisters the subscriber"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Unregister now
    pub fn cancel(self) {
        drop(self);
    }

    /// Whether the notifier this handle belongs to still exists
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.subscribers.read().iter().any(|(id, _)| *id == self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
