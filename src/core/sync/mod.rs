/*!
 * Synchronization Primitives
 *
 * - `Event`: one-shot signal/wait with timeout, used by ack waiters
 * - `SerialQueue`: one worker thread per entity, jobs run in order
 */

mod event;
mod serial;

pub use event::Event;
pub use serial::SerialQueue;
