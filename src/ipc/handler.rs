/*!
 * Application Callbacks
 *
 * Servers and clients are driven by handler objects. Every method has a
 * default, so an implementation overrides only what it uses.
 *
 * Callbacks for one client (or for a client's own session) run on a
 * single serial queue, in arrival order, never concurrently with each other.
 */

use crate::core::errors::StatusCode;
use crate::core::types::{ClientId, CorrelationId, MessageType};
use crate::ipc::registry::ClientHandle;
use bytes::Bytes;

/// Answer to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub payload: Bytes,
    pub status: StatusCode,
}

impl Reply {
    /// Successful reply carrying `payload`
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            status: StatusCode::SUCCESS,
        }
    }

    /// Empty reply with `status`
    pub fn status(status: StatusCode) -> Self {
        Self {
            payload: Bytes::new(),
            status,
        }
    }

    pub fn with_status(payload: impl Into<Bytes>, status: StatusCode) -> Self {
        Self {
            payload: payload.into(),
            status,
        }
    }
}

/// Server-side callbacks
pub trait ServerHandler: Send + Sync + 'static {
    fn on_client_connected(&self, _client: ClientHandle) {}

    /// Runs after the client is gone from the table, once its queued work is done
    fn on_client_disconnected(&self, _client: ClientHandle) {}

    fn on_message(&self, _client: ClientHandle, _msg_type: MessageType, _payload: Bytes) {}

    /// Without an override every request is answered with `INTERNAL`
    fn on_message_with_reply(
        &self,
        _client: ClientHandle,
        _msg_type: MessageType,
        _payload: Bytes,
    ) -> Reply {
        Reply::status(StatusCode::INTERNAL)
    }

    /// A reply that arrived after its request timed out
    fn on_late_reply(&self, _correlation_id: CorrelationId, _reply: Reply) {}
}

/// Client-side callbacks
pub trait ClientHandler: Send + Sync + 'static {
    fn on_connected(&self, _client_id: ClientId) {}

    /// Server closed the session or died
    fn on_disconnected(&self) {}

    fn on_message(&self, _msg_type: MessageType, _payload: Bytes) {}

    /// Without an override every request is answered with `INTERNAL`
    fn on_message_with_reply(&self, _msg_type: MessageType, _payload: Bytes) -> Reply {
        Reply::status(StatusCode::INTERNAL)
    }

    fn on_late_reply(&self, _correlation_id: CorrelationId, _reply: Reply) {}
}

/// Handler that accepts everything and does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ServerHandler for NoopHandler {}
impl ClientHandler for NoopHandler {}
