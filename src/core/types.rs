/*!
 * Core Types
 * Identifier aliases shared across the IPC engine
 */

use std::time::{SystemTime, UNIX_EPOCH};

/// Server-assigned client identifier (0 is never assigned)
pub type ClientId = u32;

/// Request/ack correlation identifier (0 means "no ack requested")
pub type CorrelationId = u64;

/// Transport endpoint identifier
pub type EndpointId = u64;

/// Stable index into a fixed-capacity pool
pub type SlotIndex = usize;

/// User-defined message type, 8 bits on the wire
pub type MessageType = u8;

/// Milliseconds since the UNIX epoch
pub type TimestampMs = u64;

/// Current wall-clock time in milliseconds since the UNIX epoch
#[inline]
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
