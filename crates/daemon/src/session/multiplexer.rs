//! Session output multiplexer.
//!
//! Fans PTY output out to every client attached to a session. Each client
//! gets a bounded queue; a client whose queue is full or whose receiver is
//! gone is disconnected instead of stalling the session or its peers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use super::pty::{SessionError, SessionId};

/// Unique identifier for a client.
pub type ClientId = String;

/// Default number of output chunks queued per client.
pub const DEFAULT_CLIENT_CAPACITY: usize = 256;

/// Statistics about a client's delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Chunks queued for the client.
    pub chunks_sent: u64,
    /// Bytes queued for the client.
    pub bytes_sent: u64,
    /// Attach time (Unix epoch milliseconds).
    pub attached_at: u64,
}

enum Delivery {
    Queued,
    Full,
    Closed,
}

/// A handle representing a connected client that receives output.
///
/// Dropping the handle drops its sender, which ends the client's receive
/// stream.
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Bytes>,
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    attached_at: u64,
}

impl ClientHandle {
    /// Creates a handle whose queue holds `capacity` chunks.
    pub fn with_capacity(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ClientHandle {
            id,
            tx,
            chunks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            attached_at: now_millis(),
        };
        (handle, rx)
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns a snapshot of the delivery statistics.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            attached_at: self.attached_at,
        }
    }

    fn try_deliver(&self, data: &Bytes) -> Delivery {
        match self.tx.try_send(data.clone()) {
            Ok(()) => {
                self.chunks_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Delivery::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

struct ClientTable {
    clients: HashMap<ClientId, Arc<ClientHandle>>,
    closed: bool,
}

/// Broadcasts PTY output to the clients attached to one session.
///
/// Broadcasting takes a snapshot of the client set under the read lock and
/// delivers outside of it, so attach and detach never wait on delivery.
pub struct SessionOutputBroadcaster {
    session_id: SessionId,
    table: RwLock<ClientTable>,
}

impl SessionOutputBroadcaster {
    /// Creates an empty broadcaster for `session_id`.
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            table: RwLock::new(ClientTable {
                clients: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Registers a client whose queue holds `capacity` chunks.
    ///
    /// Fails if the id is already attached or the broadcaster has been shut
    /// down by [`disconnect_all`](Self::disconnect_all).
    pub async fn add_client(
        &self,
        client_id: ClientId,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Bytes>, SessionError> {
        let mut table = self.table.write().await;
        if table.closed {
            return Err(SessionError::AlreadyClosed(self.session_id.clone()));
        }
        if table.clients.contains_key(&client_id) {
            return Err(SessionError::DuplicateClient(client_id));
        }

        let (handle, rx) = ClientHandle::with_capacity(client_id.clone(), capacity);
        table.clients.insert(client_id.clone(), Arc::new(handle));
        tracing::debug!(
            session_id = %self.session_id,
            client_id = %client_id,
            clients = table.clients.len(),
            "Client attached"
        );
        Ok(rx)
    }

    /// Removes a client, closing its output stream.
    ///
    /// Returns the client's statistics if it was attached.
    pub async fn remove_client(&self, client_id: &str) -> Option<ClientStats> {
        let removed = self.table.write().await.clients.remove(client_id);
        removed.map(|handle| {
            tracing::debug!(
                session_id = %self.session_id,
                client_id = %client_id,
                "Client detached"
            );
            handle.stats()
        })
    }

    /// Queues `data` for every attached client without waiting on any.
    ///
    /// Clients that cannot accept the chunk are disconnected. Returns the
    /// number of clients the chunk was queued for.
    pub async fn broadcast(&self, data: Bytes) -> usize {
        let snapshot: Vec<Arc<ClientHandle>> =
            self.table.read().await.clients.values().cloned().collect();

        let mut delivered = 0;
        let mut evicted = Vec::new();
        for client in snapshot {
            match client.try_deliver(&data) {
                Delivery::Queued => delivered += 1,
                Delivery::Full => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        client_id = %client.id,
                        "Client is not keeping up with output, disconnecting"
                    );
                    evicted.push(client);
                }
                Delivery::Closed => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        client_id = %client.id,
                        "Client went away, removing"
                    );
                    evicted.push(client);
                }
            }
        }

        if !evicted.is_empty() {
            let mut table = self.table.write().await;
            for client in evicted {
                // The id may have been re-attached since the snapshot.
                if table
                    .clients
                    .get(&client.id)
                    .is_some_and(|current| Arc::ptr_eq(current, &client))
                {
                    table.clients.remove(&client.id);
                }
            }
        }

        delivered
    }

    /// Detaches every client and refuses further attaches.
    ///
    /// Returns the number of clients that were attached.
    pub async fn disconnect_all(&self) -> usize {
        let mut table = self.table.write().await;
        table.closed = true;
        let count = table.clients.len();
        table.clients.clear();
        count
    }

    /// Returns the number of attached clients.
    pub async fn client_count(&self) -> usize {
        self.table.read().await.clients.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
