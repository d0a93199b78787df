/*!
 * msgport Library
 * Client/server message passing with request/reply correlation
 */

pub mod core;
pub mod ipc;
pub mod monitoring;

// Re-exports
pub use crate::core::{IpcConfig, IpcError, IpcResult, StatusCode};
pub use ipc::{
    Client, ClientHandle, ClientHandler, LocalBus, Network, NoopHandler, Reply, Server,
    ServerHandler,
};
pub use monitoring::{init_tracing, StatsSnapshot};
