//! Fan-out of normalized events to connected subscribers.
//!
//! The hub owns the subscriber set and every subscriber's outbound queue.
//! [`Hub::ingest`] never blocks: it snapshots the subscriber set under a short
//! lock and then pushes onto each bounded queue without holding it. A full
//! queue drops its oldest entry; a subscriber that overflows
//! [`HubConfig::eviction_threshold`] times in a row is evicted.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// Opaque identity of a registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each subscriber's outbound queue.
    pub queue_capacity: usize,
    /// Consecutive overflows after which a subscriber is evicted.
    pub eviction_threshold: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            eviction_threshold: 64,
        }
    }
}

/// One downstream connection as seen by the hub.
pub struct Subscriber {
    id: SubscriberId,
    outbound: ArrayQueue<Arc<Event>>,
    state: Mutex<SubscriberState>,
    ready: Notify,
    overflows: AtomicUsize,
    evicted: CancellationToken,
}

impl Subscriber {
    fn new(id: SubscriberId, capacity: usize) -> Self {
        Self {
            id,
            outbound: ArrayQueue::new(capacity.max(1)),
            state: Mutex::new(SubscriberState::Connecting),
            ready: Notify::new(),
            overflows: AtomicUsize::new(0),
            evicted: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock()
    }

    /// Number of events waiting to be written.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Waits for the next queued event.
    ///
    /// Returns `None` once the subscriber is no longer active, even if events
    /// remain queued.
    pub async fn next(&self) -> Option<Arc<Event>> {
        loop {
            if self.state() != SubscriberState::Active {
                return None;
            }
            if let Some(event) = self.outbound.pop() {
                return Some(event);
            }
            // `notify_one` stores a permit, so a push racing this check is not lost.
            self.ready.notified().await;
        }
    }

    /// Resolves once the hub has evicted this subscriber for overflowing.
    ///
    /// Unlike a release, eviction interrupts an in-flight write.
    pub async fn evicted(&self) {
        self.evicted.cancelled().await
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Moves an active subscriber to `Closing` and wakes its write loop.
    ///
    /// Returns `false` if it was already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SubscriberState::Connecting | SubscriberState::Active => {
                *state = SubscriberState::Closing;
                drop(state);
                self.ready.notify_one();
                true
            }
            SubscriberState::Closing | SubscriberState::Closed => false,
        }
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = SubscriberState::Closed;
    }

    /// Enqueues an event, dropping the oldest one if the queue is full.
    ///
    /// Returns the number of consecutive overflows, zero if none occurred.
    fn offer(&self, event: Arc<Event>) -> usize {
        let overflows = match self.outbound.force_push(event) {
            Some(_dropped) => self.overflows.fetch_add(1, Ordering::Relaxed) + 1,
            None => {
                self.overflows.store(0, Ordering::Relaxed);
                0
            }
        };
        self.ready.notify_one();
        overflows
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// The dispatch hub.
pub struct Hub {
    subscribers: Mutex<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Adds an active subscriber with an empty outbound queue.
    pub fn register(&self) -> Arc<Subscriber> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber::new(id, self.config.queue_capacity));

        let mut subscribers = self.subscribers.lock();
        *subscriber.state.lock() = SubscriberState::Active;
        subscribers.insert(id, Arc::clone(&subscriber));
        drop(subscribers);

        log::debug!("Registered {id}");
        subscriber
    }

    /// Removes a subscriber. Removing an unknown subscriber is a no-op.
    pub fn unregister(&self, id: SubscriberId) {
        let removed = self.subscribers.lock().remove(&id);
        if let Some(subscriber) = removed {
            subscriber.begin_close();
            log::debug!("Unregistered {id}");
        }
    }

    /// Enqueues `event` for every subscriber registered right now.
    pub fn ingest(&self, event: Event) {
        let event = Arc::new(event);
        let snapshot: Vec<_> = self.subscribers.lock().values().cloned().collect();

        let mut evicted = Vec::new();
        for subscriber in snapshot {
            let overflows = subscriber.offer(Arc::clone(&event));
            if overflows == 0 {
                continue;
            }
            log::debug!(
                "Outbound queue of {} is full, dropped its oldest event",
                subscriber.id
            );
            if overflows >= self.config.eviction_threshold {
                evicted.push(subscriber.id);
            }
        }

        for id in evicted {
            self.evict(id);
        }
    }

    fn evict(&self, id: SubscriberId) {
        let removed = self.subscribers.lock().remove(&id);
        if let Some(subscriber) = removed {
            log::warn!(
                "Evicting {id} after {} consecutive overflows",
                self.config.eviction_threshold
            );
            subscriber.evicted.cancel();
            subscriber.begin_close();
        }
    }

    /// Unregisters every subscriber, e.g. on shutdown.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.subscribers.lock().drain().map(|(_, s)| s).collect();
        for subscriber in drained {
            subscriber.begin_close();
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().contains_key(&id)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
