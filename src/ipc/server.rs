/*!
 * Server
 *
 * Owns a checked-in service endpoint, its receive loop, the client
 * registry and a correlation engine.
 *
 * # Connect handshake
 *
 * 1. Client sends internal CONNECT with WANTS_ACK
 * 2. Server registers it (id, slot, work queue) and watches its endpoint
 * 3. Server acks with the assigned id/slot and a status
 *
 * Any failure in step 2 or 3 unwinds the partial client through a
 * resource tracker and the client sees an error status, never a
 * half-registered session.
 *
 * # Dispatch
 *
 * Messages from a client run on that client's serial queue: in order per
 * client, in parallel across clients.
 */

use crate::core::config::IpcConfig;
use crate::core::errors::{IpcError, IpcResult, StatusCode};
use crate::core::guard::{ResourceId, ResourceKind, ResourceTracker};
use crate::core::types::{now_ms, EndpointId, MessageType};
use crate::ipc::correlation::CorrelationEngine;
use crate::ipc::envelope::{internal, ControlPayload, Envelope, MessageId};
use crate::ipc::handler::{Reply, ServerHandler};
use crate::ipc::receiver::{Disposition, EnvelopeSink, ReceiveLoop};
use crate::ipc::registry::{ClientHandle, ClientRecord, ClientRegistry};
use crate::ipc::transport::{EndpointLease, Network};
use crate::monitoring::{ProtocolStats, StatsSnapshot};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ServerInner {
    name: String,
    config: IpcConfig,
    network: Arc<dyn Network>,
    endpoint: EndpointId,
    handler: Arc<dyn ServerHandler>,
    registry: ClientRegistry,
    engine: CorrelationEngine,
    stats: Arc<ProtocolStats>,
    resources: ResourceTracker,
    receiver: Mutex<Option<(ReceiveLoop, ResourceId)>>,
    closed: AtomicBool,
}

/// IPC server; shuts down when dropped
pub struct Server {
    inner: Arc<ServerInner>,
}

/// A request waiting on a client's queue
struct Request {
    id: MessageId,
    control: ControlPayload,
    reply_to: EndpointId,
    payload: Bytes,
}

fn control_for(client: ClientHandle) -> ControlPayload {
    ControlPayload {
        client_id: client.id,
        slot: client.slot as u32,
        ..ControlPayload::default()
    }
}

impl Server {
    /// Check in `name` and prepare the server; call `start` or `run` to serve
    pub fn create<H: ServerHandler>(
        name: &str,
        handler: H,
        network: Arc<dyn Network>,
        config: IpcConfig,
    ) -> IpcResult<Self> {
        config.validate()?;

        let endpoint = network.check_in(name)?;
        let resources = ResourceTracker::new(config.max_resources);
        resources.track_or_reclaim(
            ResourceKind::Endpoint,
            format!("service {}", name),
            EndpointLease::new(network.clone(), endpoint),
        )?;

        let stats = Arc::new(ProtocolStats::new());
        let engine = CorrelationEngine::new(
            network.clone(),
            endpoint,
            config.max_pending_acks,
            config.send_timeout,
            stats.clone(),
        );

        info!("Server '{}' created on endpoint {}", name, endpoint);
        Ok(Self {
            inner: Arc::new(ServerInner {
                name: name.to_string(),
                registry: ClientRegistry::new(config.max_clients),
                config,
                network,
                endpoint,
                handler: Arc::new(handler),
                engine,
                stats,
                resources,
                receiver: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn endpoint(&self) -> EndpointId {
        self.inner.endpoint
    }

    /// Start the receive loop in the background; a no-op if already running
    pub fn start(&self) -> IpcResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(IpcError::NotConnected(format!("server '{}' is shut down", self.inner.name)));
        }
        let mut receiver = self.inner.receiver.lock();
        if receiver.as_ref().is_some_and(|(r, _)| r.is_running()) {
            return Ok(());
        }

        let receive_loop = ReceiveLoop::spawn(
            self.inner.name.clone(),
            self.inner.network.clone(),
            self.inner.endpoint,
            self.inner.config.receive_poll,
            Arc::new(ServerSink(self.inner.clone())),
        )?;
        let id = self.inner.resources.track_or_reclaim(
            ResourceKind::Thread,
            "receive loop",
            receive_loop.clone(),
        )?;
        *receiver = Some((receive_loop, id));
        Ok(())
    }

    /// Start and block until `stop` or `shutdown` is called elsewhere
    pub fn run(&self) -> IpcResult<()> {
        self.start()?;
        let receive_loop = self.inner.receiver.lock().as_ref().map(|(r, _)| r.clone());
        if let Some(receive_loop) = receive_loop {
            receive_loop.join();
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .receiver
            .lock()
            .as_ref()
            .is_some_and(|(r, _)| r.is_running())
    }

    /// Stop receiving; connected clients stay registered
    pub fn stop(&self) {
        self.inner.stop_receiver();
    }

    /// Fire-and-forget message to one client
    pub fn send(&self, client: ClientHandle, msg_type: MessageType, payload: impl Into<Bytes>) -> IpcResult<()> {
        let (endpoint, _) = self.inner.registry.route(client)?;
        self.inner
            .engine
            .send(endpoint, MessageId::user(msg_type), control_for(client), payload.into())
    }

    /// Request to one client, answered by its `on_message_with_reply`
    pub fn send_with_reply(
        &self,
        client: ClientHandle,
        msg_type: MessageType,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> IpcResult<Reply> {
        let (endpoint, _) = self.inner.registry.route(client)?;
        let ack = self.inner.engine.send_with_ack(
            endpoint,
            MessageId::user(msg_type),
            control_for(client),
            payload.into(),
            timeout,
        )?;
        Ok(Reply {
            status: ack.status(),
            payload: ack.payload,
        })
    }

    /// Send to every connected client
    ///
    /// Clients are snapshotted first; a failure for one client is logged
    /// and delivery continues. Returns the delivered count, or the last
    /// error if any delivery failed.
    pub fn broadcast(&self, msg_type: MessageType, payload: impl Into<Bytes>) -> IpcResult<usize> {
        let payload = payload.into();
        let clients = self.inner.registry.snapshot();
        let mut delivered = 0;
        let mut last_error = None;

        for (client, endpoint) in clients {
            match self.inner.engine.send(
                endpoint,
                MessageId::user(msg_type),
                control_for(client),
                payload.clone(),
            ) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", client, e);
                    last_error = Some(e);
                }
            }
        }

        debug!("Broadcast type {} reached {} clients", msg_type, delivered);
        match last_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Drop a client from the server side; it is told with a DISCONNECT
    pub fn disconnect_client(&self, client: ClientHandle) -> IpcResult<()> {
        let (endpoint, _) = self.inner.registry.route(client)?;
        if let Err(e) = self.inner.engine.send(
            endpoint,
            MessageId::internal(internal::DISCONNECT),
            control_for(client),
            Bytes::new(),
        ) {
            debug!("Could not notify {} of disconnect: {}", client, e);
        }
        self.inner.drop_client(client, "disconnected by server");
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn clients(&self) -> Vec<ClientHandle> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|(client, _)| client)
            .collect()
    }

    pub fn is_connected(&self, client: ClientHandle) -> bool {
        self.inner.registry.contains(client)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop, disconnect every client and release all resources
    ///
    /// Repeated calls are no-ops.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ServerInner {
    fn stop_receiver(&self) {
        let receiver = self.receiver.lock().take();
        if let Some((receive_loop, id)) = receiver {
            receive_loop.stop();
            self.resources.remove(id);
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_receiver();
        for record in self.registry.drain() {
            self.retire(record);
        }
        let aborted = self.engine.abort_all();
        let released = self.resources.cleanup_all();
        info!(
            "Server '{}' shut down ({} requests aborted, {} resources released)",
            self.name, aborted, released
        );
    }

    fn drop_client(&self, client: ClientHandle, reason: &str) {
        let Some(record) = self.registry.remove(client) else {
            return;
        };
        info!("{} {}", client, reason);
        self.retire(record);
    }

    /// Notify after the client's queued work, then stop its queue
    fn retire(&self, record: ClientRecord) {
        let client = record.handle();
        let handler = self.handler.clone();
        if record
            .queue
            .dispatch(move || handler.on_client_disconnected(client))
            .is_err()
        {
            self.handler.on_client_disconnected(client);
        }
        record.queue.shutdown();
    }

    fn deliver(&self, client: ClientHandle, request: Request) {
        let msg_type = request.id.message_type();
        if !request.id.wants_ack() {
            self.handler.on_message(client, msg_type, request.payload);
            return;
        }

        if request.control.deadline_ms.is_some_and(|deadline| now_ms() > deadline) {
            self.stats.record_expired_request();
            debug!(
                "Skipping request {} from {}: deadline passed",
                request.control.correlation_id, client
            );
            return;
        }

        let reply = self.handler.on_message_with_reply(client, msg_type, request.payload);
        if let Err(e) = self.engine.send_ack(
            request.reply_to,
            request.id,
            &request.control,
            reply.status,
            reply.payload,
        ) {
            warn!("Reply to {} failed: {}", client, e);
        }
    }

    fn reject(&self, envelope: &Envelope, control: &ControlPayload, status: StatusCode) {
        if !envelope.id.wants_ack() {
            return;
        }
        if let Some(reply_to) = envelope.reply_to {
            if let Err(e) = self
                .engine
                .send_ack(reply_to, envelope.id, control, status, Bytes::new())
            {
                debug!("Could not send rejection to endpoint {}: {}", reply_to, e);
            }
        }
    }
}

/// Receive-loop side of the server
struct ServerSink(Arc<ServerInner>);

impl ServerSink {
    fn admit(&self, peer: EndpointId, unwind: &ResourceTracker) -> IpcResult<ClientHandle> {
        let server = &self.0;
        let client = server.registry.register(peer)?;

        let owner = server.clone();
        unwind.track_with(ResourceKind::Custom, format!("registration of {}", client), move || {
            if let Some(record) = owner.registry.remove(client) {
                record.queue.shutdown();
            }
        })?;

        server.network.request_death_notification(peer, server.endpoint)?;
        Ok(client)
    }

    fn handle_connect(&self, envelope: &Envelope, control: &ControlPayload) {
        let server = &self.0;
        let Some(peer) = envelope.reply_to else {
            server.stats.record_protocol_violation();
            warn!("CONNECT without a reply endpoint discarded");
            return;
        };

        let unwind = ResourceTracker::new(4);
        let client = match self.admit(peer, &unwind) {
            Ok(client) => client,
            Err(e) => {
                unwind.cleanup_all();
                warn!("Rejecting connect from endpoint {}: {}", peer, e);
                server.reject(envelope, control, e.status());
                return;
            }
        };

        let assigned = ControlPayload {
            client_id: client.id,
            slot: client.slot as u32,
            ..*control
        };
        if let Err(e) = server
            .engine
            .send_ack(peer, envelope.id, &assigned, StatusCode::SUCCESS, Bytes::new())
        {
            warn!("Connect reply to endpoint {} failed: {}", peer, e);
            unwind.cleanup_all();
            return;
        }
        unwind.commit();

        info!("{} connected from endpoint {}", client, peer);
        let handler = server.handler.clone();
        if let Ok((_, queue)) = server.registry.route(client) {
            if let Err(e) = queue.dispatch(move || handler.on_client_connected(client)) {
                warn!("Could not queue connect notice for {}: {}", client, e);
            }
        }
    }

    fn handle_disconnect(&self, envelope: &Envelope, control: &ControlPayload) {
        let server = &self.0;
        let client = ClientHandle {
            id: control.client_id,
            slot: control.slot as usize,
        };
        match server.registry.route(client) {
            Ok((endpoint, _)) if Some(endpoint) == envelope.reply_to => {
                server.drop_client(client, "disconnected");
            }
            _ => {
                server.stats.record_protocol_violation();
                warn!("DISCONNECT for unknown {} ignored", client);
            }
        }
    }
}

impl EnvelopeSink for ServerSink {
    fn on_lifecycle(&self, envelope: Envelope) {
        let server = &self.0;
        match envelope.dead_peer() {
            Some(dead) => match server.registry.lookup_endpoint(dead) {
                Some(client) => server.drop_client(client, "died"),
                None => debug!("Death notice for unregistered endpoint {}", dead),
            },
            None => {
                server.stats.record_protocol_violation();
                warn!("Ignoring foreign message {:?}", envelope.id);
            }
        }
    }

    fn on_ack(&self, envelope: Envelope) -> Disposition {
        let server = &self.0;
        server.stats.record_received();
        if let Some(late) = server.engine.handle_ack(envelope) {
            server.handler.on_late_reply(
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
        let server = &self.0;
        server.stats.record_received();

        let control = match envelope.control() {
            Ok(control) => control,
            Err(e) => {
                server.stats.record_protocol_violation();
                warn!("Discarding message {:?}: {}", envelope.id, e);
                return Disposition::Release(envelope);
            }
        };

        if envelope.id.is_internal() {
            match envelope.id.message_type() {
                internal::CONNECT => self.handle_connect(&envelope, &control),
                internal::DISCONNECT => self.handle_disconnect(&envelope, &control),
                other => {
                    server.stats.record_protocol_violation();
                    warn!("Unknown internal message type {}", other);
                }
            }
            return Disposition::Release(envelope);
        }

        let client = ClientHandle {
            id: control.client_id,
            slot: control.slot as usize,
        };
        let route = server
            .registry
            .route(client)
            .ok()
            .filter(|(endpoint, _)| Some(*endpoint) == envelope.reply_to);
        let Some((reply_to, queue)) = route else {
            warn!("Message from unregistered sender {:?} dropped", envelope.reply_to);
            server.reject(&envelope, &control, StatusCode::NOT_CONNECTED);
            return Disposition::Release(envelope);
        };

        let wants_ack = envelope.id.wants_ack();
        let request = Request {
            id: envelope.id,
            control,
            reply_to,
            payload: envelope.payload,
        };
        let owner = server.clone();
        if let Err(e) = queue.dispatch(move || owner.deliver(client, request)) {
            debug!("{} is disconnecting, message dropped: {}", client, e);
            if wants_ack {
                if let Err(e) = server.engine.send_ack(
                    reply_to,
                    envelope.id,
                    &control,
                    StatusCode::NOT_CONNECTED,
                    Bytes::new(),
                ) {
                    debug!("Could not reject request from {}: {}", client, e);
                }
            }
        }
        Disposition::Taken
    }
}
