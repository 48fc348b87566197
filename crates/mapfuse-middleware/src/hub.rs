//! Outbound fan-out to connected clients.
//!
//! The [`ClientHub`] keeps one bounded queue per connected client.  The
//! transport drains each client's [`ClientOutbox`] and writes the packets to
//! the wire; the core only ever calls [`ClientHub::broadcast_except`].
//!
//! Fan-out uses `try_send`, so a slow or disconnected client never blocks the
//! caller or prevents delivery to the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mapfuse_types::Packet;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct HubInner {
    capacity: usize,
    clients: Mutex<HashMap<ClientId, mpsc::Sender<Packet>>>,
    failed: AtomicU64,
}

/// Registry of connected clients' outbound queues.  Clone it cheaply.
#[derive(Clone, Debug)]
pub struct ClientHub {
    inner: Arc<HubInner>,
}

impl ClientHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                clients: Mutex::new(HashMap::new()),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new client and return its id and outbound queue.
    pub fn connect(&self) -> (ClientId, ClientOutbox) {
        let id = ClientId::new();
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        self.clients().insert(id, sender);
        info!(client = %id, "client connected");
        (id, ClientOutbox { id, receiver })
    }

    /// Forget `id`.  Returns `false` when it was not connected.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let removed = self.clients().remove(&id).is_some();
        if removed {
            info!(client = %id, "client disconnected");
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Queue `packet` for every connected client except `origin`.
    ///
    /// Returns the number of clients the packet was queued for.  A client
    /// whose queue is full or closed is skipped and counted in
    /// [`failed_sends`][Self::failed_sends]; closed clients are removed.
    pub fn broadcast_except(&self, origin: ClientId, packet: &Packet) -> usize {
        let mut clients = self.clients();
        let mut sent = 0;
        clients.retain(|id, sender| {
            if *id == origin {
                return true;
            }
            match sender.try_send(packet.clone()) {
                Ok(()) => {
                    sent += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(client = %id, data_name = %packet.data_name, "client queue full, relay skipped");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(client = %id, "client queue closed, removing");
                    false
                }
            }
        });
        sent
    }

    /// Relays that could not be queued.
    pub fn failed_sends(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, mpsc::Sender<Packet>>> {
        self.inner.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One client's outbound queue, drained by the transport.
#[derive(Debug)]
pub struct ClientOutbox {
    id: ClientId,
    receiver: mpsc::Receiver<Packet>,
}

impl ClientOutbox {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Packet> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_update() -> Packet {
        Packet::new("map").bytes(vec![1, 2, 3])
    }

    #[test]
    fn broadcast_skips_origin() {
        let hub = ClientHub::new(4);
        let (origin, mut origin_box) = hub.connect();
        let mut others: Vec<ClientOutbox> = (0..3).map(|_| hub.connect().1).collect();

        assert_eq!(hub.broadcast_except(origin, &map_update()), 3);
        assert!(origin_box.try_recv().is_none());
        for outbox in &mut others {
            assert_eq!(outbox.try_recv(), Some(map_update()));
        }
    }

    #[test]
    fn slow_client_does_not_block_others() {
        let hub = ClientHub::new(1);
        let (origin, _origin_box) = hub.connect();
        let (_, _slow) = hub.connect();
        let (_, mut fast) = hub.connect();

        assert_eq!(hub.broadcast_except(origin, &map_update()), 2);
        assert!(fast.try_recv().is_some());

        // `_slow` never drains; its single slot is taken.
        assert_eq!(hub.broadcast_except(origin, &map_update()), 1);
        assert_eq!(hub.failed_sends(), 1);
        assert!(fast.try_recv().is_some());
    }

    #[test]
    fn closed_client_is_removed() {
        let hub = ClientHub::new(4);
        let (origin, _keep) = hub.connect();
        let (_, gone) = hub.connect();
        let (_, _alive) = hub.connect();
        drop(gone);

        assert_eq!(hub.broadcast_except(origin, &map_update()), 1);
        assert_eq!(hub.client_count(), 2);
    }

    #[test]
    fn disconnect_reports_membership() {
        let hub = ClientHub::new(4);
        let (id, outbox) = hub.connect();
        assert_eq!(outbox.id(), id);
        assert!(hub.disconnect(id));
        assert!(!hub.disconnect(id));
        assert_eq!(hub.client_count(), 0);
    }
}
