/*!
 * In-Process Transport
 *
 * Endpoints are bounded flume mailboxes kept in a DashMap. Releasing an
 * endpoint drops its sender, wakes any blocked receiver with an error,
 * unregisters its service names and posts peer-death envelopes to every
 * watcher.
 */

use super::{ServiceDirectory, Transport};
use crate::core::errors::{IpcError, IpcResult};
use crate::core::limits::MAILBOX_CAPACITY;
use crate::core::types::EndpointId;
use crate::ipc::envelope::Envelope;
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Mailbox {
    sender: flume::Sender<Envelope>,
    receiver: flume::Receiver<Envelope>,
}

/// In-process message bus implementing `Transport` and `ServiceDirectory`
pub struct LocalBus {
    endpoints: DashMap<EndpointId, Mailbox, RandomState>,
    watchers: DashMap<EndpointId, Vec<EndpointId>, RandomState>,
    services: DashMap<String, EndpointId, RandomState>,
    next_endpoint: AtomicU64,
    mailbox_capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(MAILBOX_CAPACITY)
    }

    /// Bus whose mailboxes hold at most `mailbox_capacity` envelopes
    pub fn with_capacity(mailbox_capacity: usize) -> Self {
        Self {
            endpoints: DashMap::with_hasher(RandomState::new()),
            watchers: DashMap::with_hasher(RandomState::new()),
            services: DashMap::with_hasher(RandomState::new()),
            next_endpoint: AtomicU64::new(1),
            mailbox_capacity: mailbox_capacity.max(1),
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn sender(&self, endpoint: EndpointId) -> Option<flume::Sender<Envelope>> {
        self.endpoints.get(&endpoint).map(|m| m.sender.clone())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalBus {
    fn allocate_endpoint(&self) -> IpcResult<EndpointId> {
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = flume::bounded(self.mailbox_capacity);
        self.endpoints.insert(id, Mailbox { sender, receiver });
        debug!("Allocated endpoint {}", id);
        Ok(id)
    }

    fn send(&self, destination: EndpointId, envelope: Envelope, timeout: Duration) -> IpcResult<()> {
        // Clone the sender out so no map shard stays locked while blocking
        let sender = self
            .sender(destination)
            .ok_or_else(|| IpcError::SendFailed(format!("endpoint {} does not exist", destination)))?;

        let sent = match Instant::now().checked_add(timeout) {
            Some(deadline) => sender.send_deadline(envelope, deadline),
            None => sender
                .send(envelope)
                .map_err(|e| flume::SendTimeoutError::Disconnected(e.into_inner())),
        };
        sent.map_err(|e| match e {
            flume::SendTimeoutError::Timeout(_) => {
                IpcError::SendFailed(format!("endpoint {} mailbox full", destination))
            }
            flume::SendTimeoutError::Disconnected(_) => {
                IpcError::SendFailed(format!("endpoint {} released", destination))
            }
        })
    }

    fn receive(&self, local: EndpointId, timeout: Duration) -> IpcResult<Option<Envelope>> {
        let receiver = self
            .endpoints
            .get(&local)
            .map(|m| m.receiver.clone())
            .ok_or_else(|| IpcError::TransportError(format!("endpoint {} does not exist", local)))?;

        let received = match Instant::now().checked_add(timeout) {
            Some(deadline) => receiver.recv_deadline(deadline),
            None => receiver
                .recv()
                .map_err(|_| flume::RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(envelope) => Ok(Some(envelope)),
            Err(flume::RecvTimeoutError::Timeout) => Ok(None),
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(IpcError::TransportError(format!("endpoint {} released", local)))
            }
        }
    }

    fn request_death_notification(&self, watched: EndpointId, notify: EndpointId) -> IpcResult<()> {
        if !self.endpoints.contains_key(&watched) {
            return Err(IpcError::NotConnected(format!("endpoint {} is already dead", watched)));
        }
        self.watchers.entry(watched).or_default().push(notify);
        Ok(())
    }

    fn release_endpoint(&self, endpoint: EndpointId) {
        if self.endpoints.remove(&endpoint).is_none() {
            return;
        }
        self.services.retain(|_, ep| *ep != endpoint);
        debug!("Released endpoint {}", endpoint);

        let Some((_, watchers)) = self.watchers.remove(&endpoint) else {
            return;
        };
        for watcher in watchers {
            let Some(sender) = self.sender(watcher) else {
                continue;
            };
            if sender.try_send(Envelope::peer_death(endpoint)).is_err() {
                warn!("Dropped death notice for endpoint {} to {}", endpoint, watcher);
            }
        }
    }

    fn is_alive(&self, endpoint: EndpointId) -> bool {
        self.endpoints.contains_key(&endpoint)
    }
}

impl ServiceDirectory for LocalBus {
    fn check_in(&self, name: &str) -> IpcResult<EndpointId> {
        if name.is_empty() {
            return Err(IpcError::InvalidParam("service name is empty".into()));
        }
        match self.services.entry(name.to_string()) {
            Entry::Occupied(_) => Err(IpcError::InvalidParam(format!(
                "service '{}' already registered",
                name
            ))),
            Entry::Vacant(slot) => {
                let endpoint = self.allocate_endpoint()?;
                slot.insert(endpoint);
                info!("Service '{}' checked in on endpoint {}", name, endpoint);
                Ok(endpoint)
            }
        }
    }

    fn lookup(&self, name: &str) -> IpcResult<EndpointId> {
        self.services
            .get(name)
            .map(|ep| *ep)
            .ok_or_else(|| IpcError::NotConnected(format!("service '{}' not found", name)))
    }
}
