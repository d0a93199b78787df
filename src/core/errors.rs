/*!
 * Error Types
 *
 * Framework error enum with miette diagnostics, plus the wire-level
 * status codes exchanged between client and server.
 *
 * Status codes are split into two blocks:
 * - `0` and small negatives: framework outcomes (success, timeout, ...)
 * - `USER_BASE` and above: application statuses, rendered through a
 *   formatter the application may install at runtime
 */

use arc_swap::ArcSwapOption;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// IPC operation result
pub type IpcResult<T> = Result<T, IpcError>;

/// Unified IPC error type with miette diagnostics
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Diagnostic)]
#[serde(rename_all = "snake_case", tag = "error", content = "details")]
pub enum IpcError {
    #[error("Invalid parameter: {0}")]
    #[diagnostic(
        code(ipc::invalid_param),
        help("An argument was out of range or the object is in the wrong state for this call.")
    )]
    InvalidParam(String),

    #[error("Out of memory: {0}")]
    #[diagnostic(code(ipc::no_memory), help("A control structure could not be allocated."))]
    NoMemory(String),

    #[error("Not connected: {0}")]
    #[diagnostic(
        code(ipc::not_connected),
        help("The peer is gone or the handle is stale. Reconnect before sending.")
    )]
    NotConnected(String),

    #[error("IPC operation timed out after {elapsed_ms}ms (timeout: {timeout_ms}ms)")]
    #[diagnostic(
        code(ipc::timeout),
        help("No reply arrived in time. A late reply is discarded; retry policy belongs to the caller.")
    )]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },

    #[error("Send failed: {0}")]
    #[diagnostic(
        code(ipc::send_failed),
        help("The transport rejected the message. The peer never saw it.")
    )]
    SendFailed(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(ipc::internal))]
    Internal(String),

    #[error("Client table full ({capacity} clients)")]
    #[diagnostic(
        code(ipc::client_full),
        help("Raise max_clients in IpcConfig or disconnect idle clients.")
    )]
    ClientFull { capacity: usize },

    #[error("Resource exhausted: {0}")]
    #[diagnostic(
        code(ipc::resource_exhausted),
        help("A fixed-capacity pool or tracker is full. Capacities are set at creation.")
    )]
    ResourceExhausted(String),

    #[error("Transport error: {0}")]
    #[diagnostic(code(ipc::transport))]
    TransportError(String),

    #[error("Protocol violation: {0}")]
    #[diagnostic(
        code(ipc::protocol_violation),
        help("A malformed envelope was received and discarded.")
    )]
    ProtocolViolation(String),

    #[error("Peer returned status {0}")]
    #[diagnostic(code(ipc::remote))]
    Remote(StatusCode),
}

impl IpcError {
    /// Status code carried on the wire for this error
    pub fn status(&self) -> StatusCode {
        match self {
            IpcError::InvalidParam(_) => StatusCode::INVALID_PARAM,
            IpcError::NoMemory(_) | IpcError::ResourceExhausted(_) => StatusCode::NO_MEMORY,
            IpcError::NotConnected(_) => StatusCode::NOT_CONNECTED,
            IpcError::Timeout { .. } => StatusCode::TIMEOUT,
            IpcError::SendFailed(_) | IpcError::TransportError(_) => StatusCode::SEND_FAILED,
            IpcError::Internal(_) | IpcError::ProtocolViolation(_) => StatusCode::INTERNAL,
            IpcError::ClientFull { .. } => StatusCode::CLIENT_FULL,
            IpcError::Remote(status) => *status,
        }
    }

    /// Rebuild an error from a non-success status received from a peer
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::INVALID_PARAM => IpcError::InvalidParam("rejected by peer".into()),
            StatusCode::NO_MEMORY => IpcError::NoMemory("peer out of memory".into()),
            StatusCode::NOT_CONNECTED => IpcError::NotConnected("peer reports not connected".into()),
            StatusCode::SEND_FAILED => IpcError::SendFailed("peer send failed".into()),
            StatusCode::INTERNAL => IpcError::Internal("peer internal error".into()),
            other => IpcError::Remote(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IpcError::Timeout { .. })
    }
}

// =============================================================================
// STATUS CODES
// =============================================================================

/// Wire status code; defaults to `SUCCESS`
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0);
    pub const INVALID_PARAM: StatusCode = StatusCode(-1);
    pub const NO_MEMORY: StatusCode = StatusCode(-2);
    pub const NOT_CONNECTED: StatusCode = StatusCode(-3);
    pub const TIMEOUT: StatusCode = StatusCode(-4);
    pub const SEND_FAILED: StatusCode = StatusCode(-5);
    pub const INTERNAL: StatusCode = StatusCode(-6);
    pub const CLIENT_FULL: StatusCode = StatusCode(-7);

    /// First application-defined status
    pub const USER_BASE: i32 = 0x10000;

    /// Application status `USER_BASE + offset`
    #[inline]
    pub const fn user(offset: i32) -> Self {
        StatusCode(Self::USER_BASE + offset)
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 >= Self::USER_BASE
    }

    /// `Ok(())` for success, the matching error otherwise
    pub fn into_result(self) -> IpcResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(IpcError::from_status(self))
        }
    }

    fn framework_name(self) -> Option<&'static str> {
        Some(match self {
            StatusCode::SUCCESS => "success",
            StatusCode::INVALID_PARAM => "invalid parameter",
            StatusCode::NO_MEMORY => "no memory",
            StatusCode::NOT_CONNECTED => "not connected",
            StatusCode::TIMEOUT => "timeout",
            StatusCode::SEND_FAILED => "send failed",
            StatusCode::INTERNAL => "internal error",
            StatusCode::CLIENT_FULL => "client table full",
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.framework_name() {
            return f.write_str(name);
        }
        if self.is_user() {
            if let Some(formatter) = USER_FORMATTER.load().as_ref() {
                if let Some(text) = (formatter.0)(*self) {
                    return f.write_str(&text);
                }
            }
            return write!(f, "user status {}", self.0 - Self::USER_BASE);
        }
        write!(f, "unknown status {}", self.0)
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({}: {})", self.0, self)
    }
}

impl From<i32> for StatusCode {
    fn from(raw: i32) -> Self {
        StatusCode(raw)
    }
}

// =============================================================================
// USER STATUS FORMATTER
// =============================================================================

struct UserFormatter(Box<dyn Fn(StatusCode) -> Option<String> + Send + Sync>);

static USER_FORMATTER: ArcSwapOption<UserFormatter> = ArcSwapOption::const_empty();

/// Install the formatter used to render application status codes.
///
/// Returning `None` falls back to the generic `user status N` text.
/// Replaces any previously installed formatter.
pub fn set_user_status_formatter<F>(formatter: F)
where
    F: Fn(StatusCode) -> Option<String> + Send + Sync + 'static,
{
    USER_FORMATTER.store(Some(Arc::new(UserFormatter(Box::new(formatter)))));
}

/// Remove the installed user status formatter
pub fn clear_user_status_formatter() {
    USER_FORMATTER.store(None);
}
