/*!
 * Resource Guards
 *
 * Deterministic teardown for multi-step initialization. Every acquired
 * resource is registered with a `ResourceTracker`; a failure at any later
 * step unwinds the registrations newest first.
 */

mod tracker;

pub use tracker::{Reclaim, ResourceId, ResourceKind, ResourceTracker};
