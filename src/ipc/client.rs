/*!
 * Client
 *
 * Owns a private endpoint with its own receive loop, a correlation engine
 * and one serial queue for its callbacks.
 *
 * The session ends when the client disconnects, the server sends
 * DISCONNECT, or the server endpoint dies. In every case blocked requests
 * fail with `NotConnected` and `on_disconnected` runs once.
 *
 * The server may push messages as soon as it has acked CONNECT, before the
 * client has finished its side of the handshake. Those are held and
 * delivered right after `on_connected`, in arrival order.
 */

use crate::core::config::IpcConfig;
use crate::core::errors::{IpcError, IpcResult};
use crate::core::guard::{ResourceKind, ResourceTracker};
use crate::core::sync::SerialQueue;
use crate::core::types::{now_ms, ClientId, EndpointId, MessageType, SlotIndex};
use crate::ipc::correlation::CorrelationEngine;
use crate::ipc::envelope::{internal, ControlPayload, Envelope, MessageId};
use crate::ipc::handler::{ClientHandler, Reply};
use crate::ipc::receiver::{Disposition, EnvelopeSink, ReceiveLoop};
use crate::ipc::transport::{EndpointLease, Network};
use crate::monitoring::{ProtocolStats, StatsSnapshot};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Established connection to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub server: EndpointId,
    pub client_id: ClientId,
    pub slot: SlotIndex,
}

impl Session {
    fn control(&self) -> ControlPayload {
        ControlPayload {
            client_id: self.client_id,
            slot: self.slot as u32,
            ..ControlPayload::default()
        }
    }
}

/// Where the client stands with its server
enum Link {
    Idle,
    Connecting {
        server: EndpointId,
        early: Vec<(Envelope, ControlPayload)>,
    },
    Connected(Session),
}

impl Link {
    fn server(&self) -> Option<EndpointId> {
        match self {
            Link::Idle => None,
            Link::Connecting { server, .. } => Some(*server),
            Link::Connected(session) => Some(session.server),
        }
    }

    fn session(&self) -> Option<Session> {
        match self {
            Link::Connected(session) => Some(*session),
            _ => None,
        }
    }
}

struct ClientInner {
    name: String,
    config: IpcConfig,
    network: Arc<dyn Network>,
    endpoint: EndpointId,
    handler: Arc<dyn ClientHandler>,
    engine: CorrelationEngine,
    stats: Arc<ProtocolStats>,
    queue: Arc<SerialQueue>,
    resources: ResourceTracker,
    link: Mutex<Link>,
    closed: AtomicBool,
}

/// IPC client; disconnects and releases its endpoint when dropped
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Allocate a local endpoint and start receiving on it
    pub fn create<H: ClientHandler>(
        name: &str,
        handler: H,
        network: Arc<dyn Network>,
        config: IpcConfig,
    ) -> IpcResult<Self> {
        config.validate()?;
        let resources = ResourceTracker::new(config.max_resources);

        let endpoint = network.allocate_endpoint()?;
        resources.track_or_reclaim(
            ResourceKind::Endpoint,
            format!("client {} endpoint", name),
            EndpointLease::new(network.clone(), endpoint),
        )?;

        let queue = Arc::new(SerialQueue::new(format!("msgport-{}", name))?);
        resources.track_or_reclaim(ResourceKind::Queue, "callback queue", queue.clone())?;

        let stats = Arc::new(ProtocolStats::new());
        let engine = CorrelationEngine::new(
            network.clone(),
            endpoint,
            config.max_pending_acks,
            config.send_timeout,
            stats.clone(),
        );

        let inner = Arc::new(ClientInner {
            name: name.to_string(),
            config,
            network,
            endpoint,
            handler: Arc::new(handler),
            engine,
            stats,
            queue,
            resources,
            link: Mutex::new(Link::Idle),
            closed: AtomicBool::new(false),
        });

        let receive_loop = ReceiveLoop::spawn(
            name,
            inner.network.clone(),
            endpoint,
            inner.config.receive_poll,
            Arc::new(ClientSink(inner.clone())),
        )?;
        inner
            .resources
            .track_or_reclaim(ResourceKind::Thread, "receive loop", receive_loop)?;

        debug!("Client '{}' created on endpoint {}", name, endpoint);
        Ok(Self { inner })
    }

    /// `create` followed by `connect`
    pub fn connect_to<H: ClientHandler>(
        service: &str,
        name: &str,
        handler: H,
        network: Arc<dyn Network>,
        config: IpcConfig,
    ) -> IpcResult<Self> {
        let client = Self::create(name, handler, network, config)?;
        client.connect(service)?;
        Ok(client)
    }

    /// Handshake with the server registered as `service`
    ///
    /// Fails with `InvalidParam` while connected or while another
    /// `connect` is still in flight.
    pub fn connect(&self, service: &str) -> IpcResult<Session> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(IpcError::NotConnected(format!("client '{}' is shut down", inner.name)));
        }

        let server = inner.network.lookup(service)?;
        {
            let mut link = inner.link.lock();
            match &*link {
                Link::Connected(session) => {
                    return Err(IpcError::InvalidParam(format!(
                        "already connected as client {}",
                        session.client_id
                    )))
                }
                Link::Connecting { .. } => {
                    return Err(IpcError::InvalidParam("connect already in progress".into()))
                }
                Link::Idle => {
                    *link = Link::Connecting {
                        server,
                        early: Vec::new(),
                    }
                }
            }
        }

        match self.handshake(service, server) {
            Ok(session) => Ok(session),
            Err(e) => {
                let mut link = inner.link.lock();
                if matches!(*link, Link::Connecting { .. }) {
                    *link = Link::Idle;
                }
                Err(e)
            }
        }
    }

    fn handshake(&self, service: &str, server: EndpointId) -> IpcResult<Session> {
        let inner = &self.inner;
        let ack = inner.engine.send_with_ack(
            server,
            MessageId::internal(internal::CONNECT),
            ControlPayload::default(),
            Bytes::new(),
            inner.config.connect_timeout,
        )?;
        ack.status().into_result()?;

        let session = Session {
            server,
            client_id: ack.control.client_id,
            slot: ack.control.slot as SlotIndex,
        };
        if let Err(e) = inner.network.request_death_notification(server, inner.endpoint) {
            warn!("Server '{}' died during connect", service);
            inner.leave(session);
            return Err(e);
        }

        let disconnected_early = match inner.establish(session) {
            Ok(disconnected_early) => disconnected_early,
            Err(e) => {
                inner.leave(session);
                return Err(e);
            }
        };
        info!(
            "Client '{}' connected to '{}' as client {} (slot {})",
            inner.name, service, session.client_id, session.slot
        );
        if disconnected_early {
            inner.end_session("was disconnected by the server");
        }
        Ok(session)
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.link.lock().session()
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.session().map(|s| s.client_id)
    }

    #[inline]
    pub fn endpoint(&self) -> EndpointId {
        self.inner.endpoint
    }

    fn current_session(&self) -> IpcResult<Session> {
        self.session()
            .ok_or_else(|| IpcError::NotConnected(format!("client '{}' has no session", self.inner.name)))
    }

    /// Fire-and-forget message to the server
    pub fn send(&self, msg_type: MessageType, payload: impl Into<Bytes>) -> IpcResult<()> {
        let session = self.current_session()?;
        self.inner
            .engine
            .send(session.server, MessageId::user(msg_type), session.control(), payload.into())
    }

    /// Request answered by the server's `on_message_with_reply`
    ///
    /// A non-success status chosen by the server handler comes back in the
    /// `Reply`, not as an error.
    pub fn send_with_reply(
        &self,
        msg_type: MessageType,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> IpcResult<Reply> {
        let session = self.current_session()?;
        let ack = self.inner.engine.send_with_ack(
            session.server,
            MessageId::user(msg_type),
            session.control(),
            payload.into(),
            timeout,
        )?;
        Ok(Reply {
            status: ack.status(),
            payload: ack.payload,
        })
    }

    /// Leave the server; `on_disconnected` runs on the callback queue
    pub fn disconnect(&self) -> IpcResult<()> {
        let session = self.current_session()?;
        self.inner.leave(session);
        self.inner.end_session("disconnected");
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Disconnect if needed, stop receiving and release everything
    ///
    /// Repeated calls are no-ops.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.is_connected() {
            if let Err(e) = self.disconnect() {
                debug!("Client '{}' disconnect during shutdown: {}", self.inner.name, e);
            }
        }
        let released = self.inner.resources.cleanup_all();
        debug!("Client '{}' shut down ({} resources released)", self.inner.name, released);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ClientInner {
    /// Tell the server this session is over; failures are only logged
    fn leave(&self, session: Session) {
        if let Err(e) = self.engine.send(
            session.server,
            MessageId::internal(internal::DISCONNECT),
            session.control(),
            Bytes::new(),
        ) {
            debug!("DISCONNECT to server failed: {}", e);
        }
    }

    /// Switch from connecting to connected
    ///
    /// `on_connected` and any messages held during the handshake are queued
    /// under the link lock, so nothing received later can overtake them.
    /// Returns `true` if the server already sent DISCONNECT.
    fn establish(self: &Arc<Self>, session: Session) -> IpcResult<bool> {
        let mut link = self.link.lock();
        let early = match std::mem::replace(&mut *link, Link::Connected(session)) {
            Link::Connecting { early, .. } => early,
            other => {
                *link = other;
                return Err(IpcError::NotConnected(format!(
                    "server endpoint {} went away during connect",
                    session.server
                )));
            }
        };

        let handler = self.handler.clone();
        let client_id = session.client_id;
        if let Err(e) = self.queue.dispatch(move || handler.on_connected(client_id)) {
            *link = Link::Idle;
            return Err(e);
        }

        for (envelope, control) in early {
            if envelope.id.is_internal() {
                if envelope.id.message_type() == internal::DISCONNECT {
                    return Ok(true);
                }
                self.stats.record_protocol_violation();
                warn!("Unknown internal message type {}", envelope.id.message_type());
                continue;
            }
            self.enqueue(envelope, control);
        }
        Ok(false)
    }

    /// Close the session once; later calls find nothing to close
    ///
    /// A handshake still in flight is abandoned and its request aborted.
    fn end_session(&self, reason: &str) {
        let previous = std::mem::replace(&mut *self.link.lock(), Link::Idle);
        let session = match previous {
            Link::Connected(session) => session,
            Link::Connecting { server, .. } => {
                self.engine.abort_all();
                debug!("Client '{}' connect to endpoint {} abandoned: {}", self.name, server, reason);
                return;
            }
            Link::Idle => return,
        };
        let aborted = self.engine.abort_all();
        info!(
            "Client '{}' (id {}) {}; {} requests aborted",
            self.name, session.client_id, reason, aborted
        );

        let handler = self.handler.clone();
        if self.queue.dispatch(move || handler.on_disconnected()).is_err() {
            self.handler.on_disconnected();
        }
    }

    fn enqueue(self: &Arc<Self>, envelope: Envelope, control: ControlPayload) {
        let owner = self.clone();
        if let Err(e) = self.queue.dispatch(move || owner.deliver(envelope, control)) {
            debug!("Client '{}' shutting down, message dropped: {}", self.name, e);
        }
    }

    fn deliver(&self, envelope: Envelope, control: ControlPayload) {
        let msg_type = envelope.id.message_type();
        if !envelope.id.wants_ack() {
            self.handler.on_message(msg_type, envelope.payload);
            return;
        }
        if control.deadline_ms.is_some_and(|deadline| now_ms() > deadline) {
            self.stats.record_expired_request();
            return;
        }

        let Some(reply_to) = envelope.reply_to else {
            self.stats.record_protocol_violation();
            warn!("Request without reply endpoint dropped");
            return;
        };
        let reply = self.handler.on_message_with_reply(msg_type, envelope.payload);
        if let Err(e) = self
            .engine
            .send_ack(reply_to, envelope.id, &control, reply.status, reply.payload)
        {
            warn!("Reply to server failed: {}", e);
        }
    }
}

/// Receive-loop side of the client
struct ClientSink(Arc<ClientInner>);

impl EnvelopeSink for ClientSink {
    fn on_lifecycle(&self, envelope: Envelope) {
        let client = &self.0;
        let server = client.link.lock().server();
        match envelope.dead_peer() {
            Some(dead) if Some(dead) == server => client.end_session("lost its server"),
            Some(dead) => debug!("Death notice for endpoint {} ignored", dead),
            None => {
                client.stats.record_protocol_violation();
                warn!("Ignoring foreign message {:?}", envelope.id);
            }
        }
    }

    fn on_ack(&self, envelope: Envelope) -> Disposition {
        let client = &self.0;
        client.stats.record_received();
        if let Some(late) = client.engine.handle_ack(envelope) {
            client.handler.on_late_reply(
                late.correlation_id,
                Reply {
                    status: late.ack.status(),
                    payload: late.ack.payload,
                },
            );
        }
        Disposition::Taken
    }

    fn on_message(&self, envelope: Envelope) -> Disposition {
        let client = &self.0;
        client.stats.record_received();

        let control = match envelope.control() {
            Ok(control) => control,
            Err(e) => {
                client.stats.record_protocol_violation();
                warn!("Discarding message {:?}: {}", envelope.id, e);
                return Disposition::Release(envelope);
            }
        };

        let mut link = client.link.lock();
        if envelope.reply_to.is_none() || envelope.reply_to != link.server() {
            drop(link);
            client.stats.record_protocol_violation();
            warn!("Message from unknown endpoint {:?} dropped", envelope.reply_to);
            return Disposition::Release(envelope);
        }
        if let Link::Connecting { early, .. } = &mut *link {
            early.push((envelope, control));
            return Disposition::Taken;
        }

        if envelope.id.is_internal() {
            drop(link);
            match envelope.id.message_type() {
                internal::DISCONNECT => client.end_session("was disconnected by the server"),
                other => {
                    client.stats.record_protocol_violation();
                    warn!("Unknown internal message type {}", other);
                }
            }
            return Disposition::Release(envelope);
        }

        // Queued under the link lock so held handshake messages go first
        client.enqueue(envelope, control);
        Disposition::Taken
    }
}
