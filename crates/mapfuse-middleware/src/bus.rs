//! Per-connection packet routing.
//!
//! One [`PacketBus`] exists per client connection.  The transport hands every
//! decoded packet to [`PacketBus::deliver`], which routes it by data name into
//! the bounded queue of each subscriber that [`requested`][PacketBus::request]
//! that stream.  Subscribers drain their queue through a [`Subscription`].
//!
//! Delivery never blocks the transport: a full queue drops the packet for that
//! subscriber only, and the drop is logged and counted.
//!
//! | Situation | Outcome |
//! |---|---|
//! | No subscriber for the data name | Packet discarded, `unrouted` counter bumped |
//! | Subscriber queue full            | Packet dropped for that subscriber, `dropped` bumped |
//! | Subscription dropped             | Route pruned on the next delivery |
//! | Subscriber requests again        | Previous route replaced, never duplicated |
//!
//! [`PacketBus::deliver_wait`] is the backpressured variant for sources that
//! can wait, and [`PacketBus::close`] ends every subscription once its queue
//! is drained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mapfuse_types::Packet;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
struct Route {
    sender: mpsc::Sender<Packet>,
    freq_ms: u64,
}

/// data name → subscriber id → route
type RouteTable = HashMap<String, HashMap<String, Route>>;

#[derive(Debug)]
struct BusInner {
    connection: String,
    capacity: usize,
    routes: Mutex<RouteTable>,
    dropped: AtomicU64,
    unrouted: AtomicU64,
}

/// Inbound router for one client connection.  Clone it cheaply – all clones
/// share the same route table.
#[derive(Clone, Debug)]
pub struct PacketBus {
    inner: Arc<BusInner>,
}

impl PacketBus {
    /// Create a bus for `connection` whose subscriber queues hold `capacity`
    /// packets each.
    pub fn new(connection: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                connection: connection.into(),
                capacity: capacity.max(1),
                routes: Mutex::new(HashMap::new()),
                dropped: AtomicU64::new(0),
                unrouted: AtomicU64::new(0),
            }),
        }
    }

    /// Label of the client connection this bus serves.
    pub fn connection(&self) -> &str {
        &self.inner.connection
    }

    /// Register `subscriber` for `data_names`, requested every `freq_ms`
    /// milliseconds, and return the queue the packets will arrive on.
    ///
    /// Requesting again with the same subscriber id replaces its previous
    /// routes; the earlier [`Subscription`] then sees its stream end.
    pub fn request(&self, subscriber: &str, data_names: &[&str], freq_ms: u64) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let mut routes = self.routes();

        for by_subscriber in routes.values_mut() {
            by_subscriber.remove(subscriber);
        }
        routes.retain(|_, by_subscriber| !by_subscriber.is_empty());

        for name in data_names {
            routes.entry((*name).to_string()).or_default().insert(
                subscriber.to_string(),
                Route {
                    sender: sender.clone(),
                    freq_ms,
                },
            );
        }
        debug!(
            connection = %self.inner.connection,
            subscriber,
            ?data_names,
            freq_ms,
            "stream requested"
        );

        Subscription {
            subscriber: subscriber.to_string(),
            receiver,
        }
    }

    /// Route `packet` to every subscriber of its data name.
    ///
    /// Returns the number of queues the packet was placed on.
    pub fn deliver(&self, packet: Packet) -> usize {
        let mut routes = self.routes();
        let Some(by_subscriber) = routes.get_mut(&packet.data_name) else {
            self.inner.unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(
                connection = %self.inner.connection,
                data_name = %packet.data_name,
                "no subscriber for packet"
            );
            return 0;
        };

        let mut delivered = 0;
        by_subscriber.retain(|subscriber, route| match route.sender.try_send(packet.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection = %self.inner.connection,
                    data_name = %packet.data_name,
                    subscriber = %subscriber,
                    "subscriber queue full, packet dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    connection = %self.inner.connection,
                    subscriber = %subscriber,
                    "subscription closed, route pruned"
                );
                false
            }
        });
        if by_subscriber.is_empty() {
            routes.remove(&packet.data_name);
        }
        delivered
    }

    /// Like [`deliver`][Self::deliver], but waits for room in full queues
    /// instead of dropping.  For sources that can be paused, such as a
    /// recorded capture.
    pub async fn deliver_wait(&self, packet: Packet) -> usize {
        let senders: Vec<mpsc::Sender<Packet>> = match self.routes().get(&packet.data_name) {
            Some(by_subscriber) => by_subscriber.values().map(|r| r.sender.clone()).collect(),
            None => Vec::new(),
        };
        if senders.is_empty() {
            self.inner.unrouted.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let mut delivered = 0;
        for sender in senders {
            // A closed subscription is pruned by the next `deliver`.
            if sender.send(packet.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop every route.  Each [`Subscription`] yields the packets already
    /// queued and then ends.
    pub fn close(&self) {
        let mut routes = self.routes();
        let streams = routes.len();
        routes.clear();
        debug!(connection = %self.inner.connection, streams, "bus closed");
    }

    /// Fastest frequency (smallest period in ms) requested for `data_name`.
    pub fn requested_frequency(&self, data_name: &str) -> Option<u64> {
        self.routes()
            .get(data_name)
            .and_then(|by_subscriber| by_subscriber.values().map(|r| r.freq_ms).min())
    }

    /// All data names with at least one route, sorted.
    pub fn data_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes().keys().cloned().collect();
        names.sort();
        names
    }

    /// Packets dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Packets discarded because nobody requested their data name.
    pub fn unrouted(&self) -> u64 {
        self.inner.unrouted.load(Ordering::Relaxed)
    }

    fn routes(&self) -> MutexGuard<'_, RouteTable> {
        self.inner.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription
// ────────────────────────────────────────────────────────────────────────────

/// The receiving end of a [`PacketBus::request`].
///
/// Dropping it unsubscribes lazily: the bus prunes the route on its next
/// delivery attempt.
#[derive(Debug)]
pub struct Subscription {
    subscriber: String,
    receiver: mpsc::Receiver<Packet>,
}

impl Subscription {
    /// Wait for the next packet.  Returns `None` once the route has been
    /// replaced or the bus dropped.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }

    /// Take a queued packet without waiting.
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.receiver.try_recv().ok()
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }
}
