/*!
 * Resource Tracker
 *
 * Ordered registry of acquired resources with reverse-order cleanup.
 *
 * Multi-step initialization registers each resource right after it is
 * acquired. If a later step fails, one `cleanup_all` call unwinds
 * everything acquired so far, newest first, with no per-step rollback code.
 *
 * # Example
 *
 * ```ignore
 * let tracker = ResourceTracker::new(16);
 * tracker.track(ResourceKind::Queue, "client-queue", queue.clone())?;
 * tracker.track(ResourceKind::Thread, "receiver", handle)?;
 * // failure here: thread joined first, then queue shut down
 * tracker.cleanup_all();
 * ```
 */

use crate::core::errors::{IpcError, IpcResult};
use crate::core::sync::SerialQueue;
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Resource category, mostly for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Endpoint,
    Memory,
    Queue,
    Thread,
    Lock,
    Pool,
    Custom,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::Memory => "memory",
            ResourceKind::Queue => "queue",
            ResourceKind::Thread => "thread",
            ResourceKind::Lock => "lock",
            ResourceKind::Pool => "pool",
            ResourceKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Type-specific cleanup, run once when the tracker unwinds
pub trait Reclaim: Send {
    fn reclaim(self: Box<Self>);
}

impl Reclaim for JoinHandle<()> {
    fn reclaim(self: Box<Self>) {
        let name = self.thread().name().unwrap_or("unnamed").to_string();
        if (*self).join().is_err() {
            error!("Tracked thread {} panicked", name);
        }
    }
}

impl Reclaim for Arc<SerialQueue> {
    fn reclaim(self: Box<Self>) {
        self.shutdown();
    }
}

struct CustomCleanup<F>(F);

impl<F: FnOnce() + Send> Reclaim for CustomCleanup<F> {
    fn reclaim(self: Box<Self>) {
        (self.0)()
    }
}

/// Handle to a tracked registration
///
/// Ids are never reused, so a stale id cannot touch a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

struct TrackedResource {
    id: ResourceId,
    kind: ResourceKind,
    name: String,
    resource: Box<dyn Reclaim>,
}

#[derive(Default)]
struct Entries {
    live: Vec<TrackedResource>,
    next_id: u64,
}

/// Fixed-capacity, internally locked resource registry
pub struct ResourceTracker {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl ResourceTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                live: Vec::with_capacity(capacity),
                next_id: 0,
            }),
            capacity,
        }
    }

    /// Register a resource with its type-specific cleanup
    ///
    /// Fails with `ResourceExhausted` at capacity; the resource is handed
    /// back to the caller untouched in that case.
    pub fn track<R>(&self, kind: ResourceKind, name: impl Into<String>, resource: R) -> Result<ResourceId, (IpcError, R)>
    where
        R: Reclaim + 'static,
    {
        let mut entries = self.entries.lock();
        if entries.live.len() >= self.capacity {
            let err = IpcError::ResourceExhausted(format!(
                "resource tracker full ({} entries)",
                self.capacity
            ));
            return Err((err, resource));
        }
        let name = name.into();
        debug!("Tracking {} resource '{}'", kind, name);
        let id = ResourceId(entries.next_id);
        entries.next_id += 1;
        entries.live.push(TrackedResource {
            id,
            kind,
            name,
            resource: Box::new(resource),
        });
        Ok(id)
    }

    /// Register a custom cleanup closure
    ///
    /// On capacity failure the closure runs immediately so nothing leaks.
    pub fn track_with<F>(&self, kind: ResourceKind, name: impl Into<String>, cleanup: F) -> IpcResult<ResourceId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.track(kind, name, CustomCleanup(cleanup))
            .map_err(|(err, rejected)| {
                Box::new(rejected).reclaim();
                err
            })
    }

    /// Register a resource, cleaning it up right away if the tracker is full
    pub fn track_or_reclaim<R>(&self, kind: ResourceKind, name: impl Into<String>, resource: R) -> IpcResult<ResourceId>
    where
        R: Reclaim + 'static,
    {
        self.track(kind, name, resource).map_err(|(err, rejected)| {
            Box::new(rejected).reclaim();
            err
        })
    }

    /// Forget a registration without running its cleanup
    ///
    /// The slot is freed for later `track` calls and the remaining entries
    /// keep their order. `false` if the id is unknown or already removed.
    pub fn remove(&self, id: ResourceId) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            match entries.live.iter().position(|e| e.id == id) {
                Some(index) => entries.live.remove(index),
                None => return false,
            }
        };
        // Dropped without its cleanup, outside the lock
        debug!("Untracked {} resource '{}'", removed.kind, removed.name);
        true
    }

    /// Forget every registration without cleanup; the caller keeps ownership
    ///
    /// Used once a multi-step setup has fully succeeded.
    pub fn commit(&self) -> usize {
        let entries = std::mem::take(&mut self.entries.lock().live);
        entries.len()
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.entries.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Clean up every live resource, newest first, then clear
    ///
    /// Returns how many cleanups ran. Repeated calls return 0.
    pub fn cleanup_all(&self) -> usize {
        let entries = std::mem::take(&mut self.entries.lock().live);
        let cleaned = entries.len();
        for entry in entries.into_iter().rev() {
            debug!("Cleaning up {} resource '{}'", entry.kind, entry.name);
            entry.resource.reclaim();
        }
        cleaned
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        let cleaned = self.cleanup_all();
        if cleaned > 0 {
            warn!("Resource tracker dropped with {} live resources; cleaned up", cleaned);
        }
    }
}
