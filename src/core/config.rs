/*!
 * IPC Configuration
 *
 * Capacities and timeouts for servers and clients. Defaults come from
 * `core::limits`; `from_env` layers `MSGPORT_*` overrides on top.
 */

use super::errors::{IpcError, IpcResult};
use super::limits;
use log::warn;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration shared by servers and clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Client table capacity
    pub max_clients: usize,
    /// Ack waiter pool capacity
    pub max_pending_acks: usize,
    /// Resource tracker capacity
    pub max_resources: usize,
    /// Bound on a single transport send
    pub send_timeout: Duration,
    /// Receive-loop bounded wait
    pub receive_poll: Duration,
    /// Handshake wait on the client
    pub connect_timeout: Duration,
    /// Per-endpoint mailbox depth (in-process transport)
    pub mailbox_capacity: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcConfig {
    pub const fn new() -> Self {
        Self {
            max_clients: limits::MAX_CLIENTS,
            max_pending_acks: limits::MAX_PENDING_ACKS,
            max_resources: limits::MAX_RESOURCES,
            send_timeout: limits::SEND_TIMEOUT,
            receive_poll: limits::RECEIVE_POLL_INTERVAL,
            connect_timeout: limits::CONNECT_TIMEOUT,
            mailbox_capacity: limits::MAILBOX_CAPACITY,
        }
    }

    /// Short polls and timeouts, for tests and demos that stop often
    pub const fn responsive() -> Self {
        Self {
            receive_poll: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(1000),
            ..Self::new()
        }
    }

    /// Defaults overridden by `MSGPORT_*` environment variables
    ///
    /// Environment variables:
    /// - MSGPORT_MAX_CLIENTS
    /// - MSGPORT_MAX_PENDING_ACKS
    /// - MSGPORT_SEND_TIMEOUT_MS
    /// - MSGPORT_RECEIVE_POLL_MS
    /// - MSGPORT_CONNECT_TIMEOUT_MS
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(v) = env_value::<usize>("MSGPORT_MAX_CLIENTS") {
            config.max_clients = v;
        }
        if let Some(v) = env_value::<usize>("MSGPORT_MAX_PENDING_ACKS") {
            config.max_pending_acks = v;
        }
        if let Some(v) = env_value::<u64>("MSGPORT_SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_value::<u64>("MSGPORT_RECEIVE_POLL_MS") {
            config.receive_poll = Duration::from_millis(v);
        }
        if let Some(v) = env_value::<u64>("MSGPORT_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(v);
        }
        config
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_max_pending_acks(mut self, max_pending_acks: usize) -> Self {
        self.max_pending_acks = max_pending_acks;
        self
    }

    pub fn with_max_resources(mut self, max_resources: usize) -> Self {
        self.max_resources = max_resources;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_receive_poll(mut self, poll: Duration) -> Self {
        self.receive_poll = poll;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Reject zero capacities and zero timeouts
    pub fn validate(&self) -> IpcResult<()> {
        let capacities = [
            ("max_clients", self.max_clients),
            ("max_pending_acks", self.max_pending_acks),
            ("max_resources", self.max_resources),
            ("mailbox_capacity", self.mailbox_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(IpcError::InvalidParam(format!("{} must be non-zero", name)));
            }
        }
        let timeouts = [
            ("send_timeout", self.send_timeout),
            ("receive_poll", self.receive_poll),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(IpcError::InvalidParam(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}
