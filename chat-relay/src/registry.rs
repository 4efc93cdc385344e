use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::message::Delivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient outbound queue is full")]
    QueueFull,
    #[error("recipient connection is not open")]
    NotOpen,
}

/// Sending side of one accepted connection.
///
/// Clones share the lifecycle state, so the registry and the owning session
/// always agree on whether the connection is still open.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Delivery>,
    state: Arc<AtomicU8>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Creates an open handle and the queue its writer task drains.
    pub fn new(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            outbound,
            state: Arc::new(AtomicU8::new(ConnectionState::Open as u8)),
        };
        (handle, inbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open && !self.outbound.is_closed()
    }

    pub fn begin_close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn mark_closed(&self) {
        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Queues a delivery without waiting; a slow recipient loses the frame.
    pub fn try_deliver(&self, delivery: Delivery) -> Result<(), DeliveryError> {
        if self.state() != ConnectionState::Open {
            return Err(DeliveryError::NotOpen);
        }
        self.outbound.try_send(delivery).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::NotOpen,
        })
    }
}

/// Live directory from client identity to its connection.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Maps `identity` to `handle`, returning the connection it displaced.
    ///
    /// Any other identity the same connection held before is dropped so a
    /// connection is reachable under one identity at a time.
    pub async fn register(
        &self,
        identity: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut entries = self.entries.lock().await;
        let id = handle.id();
        entries.retain(|key, existing| key == identity || existing.id() != id);
        entries
            .insert(identity.to_string(), handle)
            .filter(|previous| previous.id() != id)
    }

    /// Removes every identity pointing at `id` and returns them.
    pub async fn remove_connection(&self, id: ConnectionId) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let removed: Vec<String> = entries
            .iter()
            .filter(|(_, handle)| handle.id() == id)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &removed {
            entries.remove(identity);
        }
        removed
    }

    pub async fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        let entries = self.entries.lock().await;
        entries.get(identity).cloned()
    }

    /// Snapshot of every registered connection except `identity`'s.
    pub async fn snapshot_except(&self, identity: &str) -> Vec<(String, ConnectionHandle)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(key, _)| key.as_str() != identity)
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.entries.lock().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
