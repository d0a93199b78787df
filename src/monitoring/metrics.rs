/*!
 * Protocol Statistics
 * Lock-free counters for one server or client
 */

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-instance protocol counters
#[derive(Debug, Default)]
pub struct ProtocolStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    acks_matched: AtomicU64,
    timeouts: AtomicU64,
    late_acks: AtomicU64,
    unknown_acks: AtomicU64,
    send_failures: AtomicU64,
    protocol_violations: AtomicU64,
    expired_requests: AtomicU64,
}

/// Point-in-time copy of `ProtocolStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub acks_matched: u64,
    pub timeouts: u64,
    /// Replies that lost the race against their caller's timeout
    pub late_acks: u64,
    /// Replies for correlation ids no longer tracked
    pub unknown_acks: u64,
    pub send_failures: u64,
    pub protocol_violations: u64,
    /// Requests skipped because their deadline passed before dispatch
    pub expired_requests: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ProtocolStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_sent => messages_sent,
        record_received => messages_received,
        record_ack_matched => acks_matched,
        record_timeout => timeouts,
        record_late_ack => late_acks,
        record_unknown_ack => unknown_acks,
        record_send_failure => send_failures,
        record_protocol_violation => protocol_violations,
        record_expired_request => expired_requests,
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            acks_matched: self.acks_matched.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            late_acks: self.late_acks.load(Ordering::Relaxed),
            unknown_acks: self.unknown_acks.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            expired_requests: self.expired_requests.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Replies that arrived with nobody waiting
    pub fn discarded_acks(&self) -> u64 {
        self.late_acks + self.unknown_acks
    }
}
