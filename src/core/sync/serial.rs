/*!
 * Serial Work Queue
 *
 * A named worker thread fed by a flume channel. Jobs submitted to one
 * queue run one at a time in submission order; separate queues run in
 * parallel. Used to serialize callbacks per client.
 */

use crate::core::errors::{IpcError, IpcResult};
use log::{debug, error};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sequential executor backed by one dedicated thread
pub struct SerialQueue {
    name: String,
    sender: Mutex<Option<flume::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl SerialQueue {
    /// Spawn the worker thread
    pub fn new(name: impl Into<String>) -> IpcResult<Self> {
        let name = name.into();
        let (sender, receiver) = flume::unbounded::<Job>();
        let label = name.clone();

        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Runs until every sender is dropped and the backlog is empty
                for job in receiver.iter() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Job panicked on serial queue {}", label);
                    }
                }
                debug!("Serial queue {} drained", label);
            })
            .map_err(|e| IpcError::NoMemory(format!("spawn serial queue {}: {}", name, e)))?;

        Ok(Self {
            thread_id: worker.thread().id(),
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from this queue's worker thread
    #[inline]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Enqueue `job` without waiting for it
    pub fn dispatch<F>(&self, job: F) -> IpcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| IpcError::NotConnected(format!("serial queue {} closed", self.name)))?;
        sender
            .send(Box::new(job))
            .map_err(|_| IpcError::Internal(format!("serial queue {} worker gone", self.name)))
    }

    /// Run `job` on the queue and wait for its result
    ///
    /// Runs inline when already on the worker thread.
    pub fn dispatch_sync<F, R>(&self, job: F) -> IpcResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }
        let (tx, rx) = flume::bounded(1);
        self.dispatch(move || {
            let _ = tx.send(job());
        })?;
        rx.recv()
            .map_err(|_| IpcError::Internal(format!("job on serial queue {} did not finish", self.name)))
    }

    /// Stop accepting work, let the backlog finish, then join the worker
    ///
    /// From the worker thread itself the join is skipped; the thread exits
    /// once the current job returns. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if self.is_current() {
                return;
            }
            if worker.join().is_err() {
                error!("Serial queue {} worker panicked", self.name);
            }
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
