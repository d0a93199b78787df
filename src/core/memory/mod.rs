/*!
 * Memory Utilities
 *
 * Fixed-capacity storage used by the IPC engine:
 * - Slot pool: indexed allocator with a LIFO free list (ack waiters)
 * - Linear pool: caller-indexed table with per-entry locks (client records)
 *
 * # Performance
 *
 * - Slot pool: O(1) allocate/free, no growth
 * - Linear pool: locking one entry never blocks unrelated entries
 */

mod linear_pool;
mod pool;

pub use linear_pool::{EntryGuard, LinearPool};
pub use pool::SlotPool;
