/*!
 * Limits and Constants
 *
 * Centralized capacities, timings and wire constants for the IPC engine.
 * Grouped by domain; `IpcConfig` defaults are taken from here.
 */

use std::time::Duration;

// =============================================================================
// CLIENT REGISTRY
// =============================================================================

/// Maximum simultaneously connected clients per server
pub const MAX_CLIENTS: usize = 100;

/// First client id handed out by a registry (0 is never assigned)
pub const FIRST_CLIENT_ID: u32 = 1;

// =============================================================================
// CORRELATION ENGINE
// =============================================================================

/// Maximum outstanding ack waiters per endpoint
pub const MAX_PENDING_ACKS: usize = 256;

/// First correlation id issued (0 means "no ack requested")
pub const FIRST_CORRELATION_ID: u64 = 1;

/// Default request/reply timeout when the caller has no preference
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

// =============================================================================
// RESOURCE TRACKING
// =============================================================================

/// Maximum resources registered with a single tracker
pub const MAX_RESOURCES: usize = 256;

// =============================================================================
// TRANSPORT TIMING
// =============================================================================

/// Upper bound for a single transport send
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Receive-loop bounded wait; the loop checks its shutdown flag this often
pub const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// How long a client waits for the connect handshake reply
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Queue depth of an in-process endpoint mailbox
pub const MAILBOX_CAPACITY: usize = 1024;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Protocol magic stored in message id bits [31:20]
pub const PROTOCOL_MAGIC: u32 = 0x875;

/// Bit offset of the protocol magic
pub const MAGIC_SHIFT: u32 = 20;

/// Bit offset of the feature flags field [19:8]
pub const FEATURES_SHIFT: u32 = 8;

/// Mask for the 12-bit magic and feature fields
pub const FIELD_MASK: u32 = 0xFFF;

/// Mask for the 8-bit message type [7:0]
pub const TYPE_MASK: u32 = 0xFF;
