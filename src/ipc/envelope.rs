/*!
 * Message Envelope
 *
 * Message IDs pack three fields into one `u32`:
 *
 * ```text
 *  31        20 19         8 7        0
 * +------------+------------+----------+
 * |   magic    |  features  |   type   |
 * +------------+------------+----------+
 * ```
 *
 * IDs whose magic does not match are not ours; the receive loop treats
 * them as lifecycle notifications (peer death) rather than errors.
 *
 * The control payload (client id, correlation id, status, deadline) is
 * bincode-encoded into its own segment, separate from the opaque user payload.
 */

use crate::core::errors::{IpcError, IpcResult, StatusCode};
use crate::core::limits::{FEATURES_SHIFT, FIELD_MASK, MAGIC_SHIFT, PROTOCOL_MAGIC, TYPE_MASK};
use crate::core::types::{ClientId, CorrelationId, EndpointId, MessageType, TimestampMs};
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Feature bits carried in message id bits [19:8]
    ///
    /// `WANTS_ACK` and `IS_ACK` are managed by the correlation engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// Framework control message (handshake, disconnect)
        const INTERNAL = 1 << 0;
        /// Sender blocks for an ack with the same correlation id
        const WANTS_ACK = 1 << 1;
        /// Reply leg of a request
        const IS_ACK = 1 << 2;
    }
}

/// Internal message types, only meaningful with `Features::INTERNAL`
pub mod internal {
    use crate::core::types::MessageType;

    pub const CONNECT: MessageType = 1;
    pub const DISCONNECT: MessageType = 2;
}

/// Raw id of the transport's peer-death notification (not our magic)
pub const PEER_DEATH_NOTIFICATION: u32 = 0x48;

/// Packed message identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u32);

impl MessageId {
    /// Build an id in our protocol
    #[inline]
    pub const fn encode(features: Features, msg_type: MessageType) -> Self {
        MessageId(
            (PROTOCOL_MAGIC << MAGIC_SHIFT)
                | ((features.bits() & FIELD_MASK) << FEATURES_SHIFT)
                | (msg_type as u32 & TYPE_MASK),
        )
    }

    /// User message, external partition
    #[inline]
    pub const fn user(msg_type: MessageType) -> Self {
        Self::encode(Features::empty(), msg_type)
    }

    /// Control message, internal partition
    #[inline]
    pub const fn internal(msg_type: MessageType) -> Self {
        Self::encode(Features::INTERNAL, msg_type)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        MessageId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// True when the magic field identifies this protocol
    #[inline]
    pub const fn is_protocol(self) -> bool {
        (self.0 >> MAGIC_SHIFT) & FIELD_MASK == PROTOCOL_MAGIC
    }

    #[inline]
    pub const fn features(self) -> Features {
        Features::from_bits_truncate((self.0 >> FEATURES_SHIFT) & FIELD_MASK)
    }

    #[inline]
    pub const fn message_type(self) -> MessageType {
        (self.0 & TYPE_MASK) as MessageType
    }

    /// `(is_protocol, features, type)`
    #[inline]
    pub const fn decode(self) -> (bool, Features, MessageType) {
        (self.is_protocol(), self.features(), self.message_type())
    }

    #[inline]
    pub const fn has(self, feature: Features) -> bool {
        self.features().contains(feature)
    }

    #[inline]
    pub const fn is_internal(self) -> bool {
        self.has(Features::INTERNAL)
    }

    #[inline]
    pub const fn wants_ack(self) -> bool {
        self.has(Features::WANTS_ACK)
    }

    #[inline]
    pub const fn is_ack(self) -> bool {
        self.has(Features::IS_ACK)
    }

    #[inline]
    pub const fn set(self, feature: Features) -> Self {
        MessageId(self.0 | ((feature.bits() & FIELD_MASK) << FEATURES_SHIFT))
    }

    #[inline]
    pub const fn clear(self, feature: Features) -> Self {
        MessageId(self.0 & !((feature.bits() & FIELD_MASK) << FEATURES_SHIFT))
    }

    /// Request form: `WANTS_ACK` on, `IS_ACK` off
    #[inline]
    pub(crate) const fn as_request(self) -> Self {
        self.clear(Features::IS_ACK).set(Features::WANTS_ACK)
    }

    /// Reply form: `IS_ACK` on, `WANTS_ACK` off
    #[inline]
    pub(crate) const fn as_ack(self) -> Self {
        self.clear(Features::WANTS_ACK).set(Features::IS_ACK)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_protocol() {
            write!(
                f,
                "MessageId(0x{:08x} type={} {:?})",
                self.0,
                self.message_type(),
                self.features()
            )
        } else {
            write!(f, "MessageId(0x{:08x} foreign)", self.0)
        }
    }
}

/// Framework header fields carried in the control segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub client_id: ClientId,
    pub slot: u32,
    /// 0 = no ack requested
    pub correlation_id: CorrelationId,
    pub status: StatusCode,
    /// Absolute, milliseconds since the UNIX epoch
    pub deadline_ms: Option<TimestampMs>,
}

impl ControlPayload {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn encode(&self) -> IpcResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| IpcError::Internal(format!("control payload encode: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> IpcResult<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        bincode::deserialize(bytes)
            .map_err(|e| IpcError::ProtocolViolation(format!("control payload decode: {}", e)))
    }
}

/// One message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    /// Endpoint the peer should answer on
    pub reply_to: Option<EndpointId>,
    pub control: Bytes,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(id: MessageId, control: &ControlPayload, payload: Bytes) -> IpcResult<Self> {
        Ok(Self {
            id,
            reply_to: None,
            control: control.encode()?,
            payload,
        })
    }

    pub fn with_reply_to(mut self, endpoint: EndpointId) -> Self {
        self.reply_to = Some(endpoint);
        self
    }

    /// Decode the control segment
    pub fn control(&self) -> IpcResult<ControlPayload> {
        ControlPayload::decode(&self.control)
    }

    /// Notification that `endpoint` died, as delivered by a transport
    pub fn peer_death(endpoint: EndpointId) -> Self {
        Self {
            id: MessageId::from_raw(PEER_DEATH_NOTIFICATION),
            reply_to: None,
            control: Bytes::new(),
            payload: Bytes::copy_from_slice(&endpoint.to_be_bytes()),
        }
    }

    /// The dead endpoint, if this is a peer-death notification
    pub fn dead_peer(&self) -> Option<EndpointId> {
        if self.id.raw() != PEER_DEATH_NOTIFICATION {
            return None;
        }
        let bytes: [u8; 8] = self.payload.as_ref().try_into().ok()?;
        Some(EndpointId::from_be_bytes(bytes))
    }
}
