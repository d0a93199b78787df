/*!
 * Core Module
 * Errors, limits, configuration, pools and synchronization primitives
 */

pub mod config;
pub mod errors;
pub mod guard;
pub mod limits;
pub mod memory;
pub mod sync;
pub mod types;

// Re-export for convenience
pub use config::IpcConfig;
pub use errors::{
    clear_user_status_formatter, set_user_status_formatter, IpcError, IpcResult, StatusCode,
};
pub use guard::{Reclaim, ResourceId, ResourceKind, ResourceTracker};
pub use memory::{EntryGuard, LinearPool, SlotPool};
pub use sync::{Event, SerialQueue};
pub use types::*;
