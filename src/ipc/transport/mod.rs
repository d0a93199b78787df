/*!
 * Transport Boundary
 *
 * The engine never moves bytes itself. It talks to a `Transport` for
 * endpoint send/receive and peer-death notification, and to a
 * `ServiceDirectory` for name registration and lookup.
 *
 * `LocalBus` implements both in-process.
 */

mod local;

pub use local::LocalBus;

use crate::core::errors::IpcResult;
use crate::core::guard::Reclaim;
use crate::core::types::EndpointId;
use crate::ipc::envelope::Envelope;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Endpoint-level message passing
pub trait Transport: Send + Sync {
    /// Create a fresh receive endpoint
    fn allocate_endpoint(&self) -> IpcResult<EndpointId>;

    /// Deliver `envelope` to `destination`, waiting at most `timeout` for room
    fn send(&self, destination: EndpointId, envelope: Envelope, timeout: Duration) -> IpcResult<()>;

    /// Next envelope on `local`; `Ok(None)` when `timeout` elapses first
    fn receive(&self, local: EndpointId, timeout: Duration) -> IpcResult<Option<Envelope>>;

    /// Deliver a peer-death envelope to `notify` once `watched` goes away
    fn request_death_notification(&self, watched: EndpointId, notify: EndpointId) -> IpcResult<()>;

    /// Destroy an endpoint; death notifications for it fire
    fn release_endpoint(&self, endpoint: EndpointId);

    fn is_alive(&self, endpoint: EndpointId) -> bool;
}

/// Name registration for servers, lookup for clients
pub trait ServiceDirectory: Send + Sync {
    /// Register `name` and return its service endpoint
    fn check_in(&self, name: &str) -> IpcResult<EndpointId>;

    /// Endpoint registered under `name`
    fn lookup(&self, name: &str) -> IpcResult<EndpointId>;
}

/// Transport plus directory, as servers and clients consume them
pub trait Network: Transport + ServiceDirectory {}

impl<T: Transport + ServiceDirectory + ?Sized> Network for T {}

/// Owned endpoint, released when reclaimed by a resource tracker
pub struct EndpointLease<N: ?Sized + Transport> {
    transport: Arc<N>,
    endpoint: EndpointId,
}

impl<N: ?Sized + Transport> EndpointLease<N> {
    pub fn new(transport: Arc<N>, endpoint: EndpointId) -> Self {
        Self { transport, endpoint }
    }

    #[inline]
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }
}

impl<N: ?Sized + Transport + 'static> Reclaim for EndpointLease<N> {
    fn reclaim(self: Box<Self>) {
        debug!("Releasing endpoint {}", self.endpoint);
        self.transport.release_endpoint(self.endpoint);
    }
}
