/*!
 * Client Registry
 *
 * Server-side table of connected clients. A coarse index lock guards id
 * assignment and the endpoint map; records live in a `LinearPool` so each
 * client's slot can be locked on its own.
 *
 * # Locking
 *
 * The index lock may be held while the pool places a record, but no path
 * takes the index lock while holding an entry lock.
 */

use crate::core::errors::{IpcError, IpcResult};
use crate::core::limits::FIRST_CLIENT_ID;
use crate::core::memory::{EntryGuard, LinearPool};
use crate::core::sync::SerialQueue;
use crate::core::types::{ClientId, EndpointId, SlotIndex};
use ahash::RandomState;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Server-side reference to a client; stale once its slot is reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientHandle {
    pub id: ClientId,
    pub slot: SlotIndex,
}

impl fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {} (slot {})", self.id, self.slot)
    }
}

/// One connected client
pub struct ClientRecord {
    pub id: ClientId,
    pub slot: SlotIndex,
    /// Peer endpoint replies and server pushes go to
    pub endpoint: EndpointId,
    /// Serializes this client's callbacks
    pub queue: Arc<SerialQueue>,
    pub connected_at: Instant,
}

impl ClientRecord {
    #[inline]
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            id: self.id,
            slot: self.slot,
        }
    }
}

struct RegistryIndex {
    next_id: ClientId,
    by_endpoint: HashMap<EndpointId, ClientHandle, RandomState>,
}

/// Fixed-capacity table of connected clients
pub struct ClientRegistry {
    index: parking_lot::Mutex<RegistryIndex>,
    records: LinearPool<ClientRecord>,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: parking_lot::Mutex::new(RegistryIndex {
                next_id: FIRST_CLIENT_ID,
                by_endpoint: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
            }),
            records: LinearPool::new(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    /// Admit the peer at `endpoint`
    ///
    /// Assigns the next id and a free slot and starts the client's work
    /// queue. Fails if the peer is already registered or the table is full.
    pub fn register(&self, endpoint: EndpointId) -> IpcResult<ClientHandle> {
        let mut index = self.index.lock();
        if let Some(existing) = index.by_endpoint.get(&endpoint) {
            return Err(IpcError::InvalidParam(format!(
                "endpoint {} already registered as {}",
                endpoint, existing
            )));
        }
        let slot = self.records.find_free().ok_or(IpcError::ClientFull {
            capacity: self.records.capacity(),
        })?;

        let id = index.next_id;
        let queue = Arc::new(SerialQueue::new(format!("msgport-client-{}", id))?);
        self.records.set(
            slot,
            ClientRecord {
                id,
                slot,
                endpoint,
                queue,
                connected_at: Instant::now(),
            },
        )?;

        index.next_id = match id.wrapping_add(1) {
            0 => FIRST_CLIENT_ID,
            next => next,
        };
        let handle = ClientHandle { id, slot };
        index.by_endpoint.insert(endpoint, handle);
        info!("Registered {} at endpoint {}", handle, endpoint);
        Ok(handle)
    }

    /// Handle of the client at `endpoint`
    pub fn lookup_endpoint(&self, endpoint: EndpointId) -> Option<ClientHandle> {
        self.index.lock().by_endpoint.get(&endpoint).copied()
    }

    /// Lock the record `handle` refers to; `None` if gone or reused
    pub fn lock(&self, handle: ClientHandle) -> Option<EntryGuard<'_, ClientRecord>> {
        let record = self.records.lock_entry(handle.slot)?;
        (record.id == handle.id).then_some(record)
    }

    /// `(endpoint, queue)` for a live client
    pub fn route(&self, handle: ClientHandle) -> IpcResult<(EndpointId, Arc<SerialQueue>)> {
        self.lock(handle)
            .map(|record| (record.endpoint, record.queue.clone()))
            .ok_or_else(|| IpcError::NotConnected(format!("{} is not connected", handle)))
    }

    pub fn contains(&self, handle: ClientHandle) -> bool {
        self.lock(handle).is_some()
    }

    /// Unregister and return the record
    pub fn remove(&self, handle: ClientHandle) -> Option<ClientRecord> {
        {
            let mut index = self.index.lock();
            let endpoint = index
                .by_endpoint
                .iter()
                .find_map(|(ep, h)| (*h == handle).then_some(*ep))?;
            index.by_endpoint.remove(&endpoint);
        }
        let record = self.lock(handle)?.remove();
        debug!("Unregistered {}", handle);
        Some(record)
    }

    /// Connected clients with their endpoints, as of the call
    pub fn snapshot(&self) -> Vec<(ClientHandle, EndpointId)> {
        let index = self.index.lock();
        let mut clients: Vec<_> = index.by_endpoint.iter().map(|(ep, h)| (*h, *ep)).collect();
        clients.sort_by_key(|(h, _)| h.id);
        clients
    }

    pub fn len(&self) -> usize {
        self.index.lock().by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister every client, returning their records
    pub fn drain(&self) -> Vec<ClientRecord> {
        self.snapshot()
            .into_iter()
            .filter_map(|(handle, _)| self.remove(handle))
            .collect()
    }
}
