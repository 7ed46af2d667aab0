//! Change notification for logical collections.
//!
//! Observers subscribe to a [`CollectionId`] and receive [`ChangeEvent`]s on
//! their own channel. Writers call [`ChangeNotifier::notify`] only after their
//! transaction committed, so an observer that re-queries on an event always
//! sees the write that caused it.
//!
//! Collections form a small hierarchy mirroring the path form of addresses:
//! `feeds` contains every `feeds/{selector}/entries`. A notification reaches
//! observers of the notified collection and of its ancestors and
//! descendants, so an overlay write announced on `Feeds` also refreshes open
//! entry lists.

use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::storage::FeedSelector;

/// Logical collections observers can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionId {
    /// The feed listing, including unread counts
    Feeds,
    /// Entries of one feed or of a sentinel collection
    Entries(FeedSelector),
    SyncLog,
}

impl CollectionId {
    /// Whether a notification for `self` concerns an observer of `other`.
    pub fn is_related(self, other: CollectionId) -> bool {
        self == other
            || matches!(
                (self, other),
                (CollectionId::Feeds, CollectionId::Entries(_))
                    | (CollectionId::Entries(_), CollectionId::Feeds)
            )
    }
}

/// Delivered to observers after a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    /// The collection the writer announced
    pub collection: CollectionId,
}

struct Observer {
    collection: CollectionId,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: HashMap<u64, Observer>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // A panicking observer cannot leave the map half-updated; keep serving.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Registry of observers keyed by collection.
///
/// Cloning shares the registry. Owned by [`crate::storage::Database`]; there
/// is no process-global instance.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(&self, collection: CollectionId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.observers.insert(id, Observer { collection, tx });
        tracing::debug!(observer = id, ?collection, "Observer registered");

        Subscription {
            id,
            collection,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Queue `collection` for every related observer registered right now.
    ///
    /// Never blocks. Observers whose receiving side is gone are dropped from
    /// the registry; they do not affect delivery to the others.
    /// Returns the number of observers reached.
    pub fn notify(&self, collection: CollectionId) -> usize {
        let event = ChangeEvent { collection };
        let mut registry = lock(&self.registry);
        let mut delivered = 0;
        let mut vanished = Vec::new();

        for (id, observer) in &registry.observers {
            if !collection.is_related(observer.collection) {
                continue;
            }
            if observer.tx.send(event).is_ok() {
                delivered += 1;
            } else {
                vanished.push(*id);
            }
        }

        for id in vanished {
            registry.observers.remove(&id);
            tracing::debug!(observer = id, "Dropped vanished observer");
        }

        tracing::trace!(?collection, delivered, "Notified observers");
        delivered
    }

    /// Notify each distinct collection once.
    pub fn notify_all<I>(&self, collections: I)
    where
        I: IntoIterator<Item = CollectionId>,
    {
        let mut seen: Vec<CollectionId> = Vec::new();
        for collection in collections {
            if !seen.contains(&collection) {
                seen.push(collection);
                self.notify(collection);
            }
        }
    }

    /// Number of live registrations.
    pub fn observer_count(&self) -> usize {
        lock(&self.registry).observers.len()
    }
}

/// A registered observer. Dropping it unregisters.
///
/// Implements [`Stream`], yielding events as they arrive.
pub struct Subscription {
    id: u64,
    collection: CollectionId,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// Wait for the next event. `None` once the notifier is gone and every
    /// queued event was consumed.
    pub async fn changed(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Take an already queued event without waiting.
    pub fn try_changed(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).observers.remove(&self.id);
            tracing::debug!(observer = self.id, "Observer unregistered");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .finish()
    }
}
