/*!
 * Receive Loop
 *
 * One thread per local endpoint. Each pass waits at most one poll
 * interval for an envelope, so a stop request is seen promptly.
 *
 * Envelopes are classified and handed to an `EnvelopeSink`:
 * - foreign ids (peer-death notices) go to `on_lifecycle`
 * - `IS_ACK` envelopes go to `on_ack`
 * - everything else goes to `on_message`
 *
 * Ownership moves with the envelope. A sink that keeps it (for example
 * by queueing it for a worker) returns `Disposition::Taken`; one that is
 * done with it hands it back with `Disposition::Release` and the loop
 * drops it.
 */

use crate::core::errors::{IpcError, IpcResult};
use crate::core::guard::Reclaim;
use crate::core::types::EndpointId;
use crate::ipc::envelope::Envelope;
use crate::ipc::transport::Network;
use log::{debug, error, info, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What the sink did with an envelope
#[derive(Debug)]
pub enum Disposition {
    /// The sink kept the envelope
    Taken,
    /// The sink is done; the loop drops it
    Release(Envelope),
}

/// Consumer of classified envelopes
pub trait EnvelopeSink: Send + Sync + 'static {
    /// Envelope outside our protocol, e.g. a peer-death notice
    fn on_lifecycle(&self, envelope: Envelope);

    /// Reply leg of an earlier request
    fn on_ack(&self, envelope: Envelope) -> Disposition;

    /// Application or control message
    fn on_message(&self, envelope: Envelope) -> Disposition;
}

/// Route one envelope to the matching sink callback
pub fn dispatch<S: EnvelopeSink + ?Sized>(sink: &S, envelope: Envelope) {
    let disposition = if !envelope.id.is_protocol() {
        sink.on_lifecycle(envelope);
        Disposition::Taken
    } else if envelope.id.is_ack() {
        sink.on_ack(envelope)
    } else {
        sink.on_message(envelope)
    };

    if let Disposition::Release(envelope) = disposition {
        trace!("Releasing envelope {:?}", envelope.id);
        drop(envelope);
    }
}

struct LoopControl {
    name: String,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running receive loop; clones control the same thread
#[derive(Clone)]
pub struct ReceiveLoop {
    control: Arc<LoopControl>,
}

impl ReceiveLoop {
    /// Start receiving on `endpoint` in a new named thread
    pub fn spawn(
        name: impl Into<String>,
        network: Arc<dyn Network>,
        endpoint: EndpointId,
        poll: Duration,
        sink: Arc<dyn EnvelopeSink>,
    ) -> IpcResult<Self> {
        let name = name.into();
        let control = Arc::new(LoopControl {
            name: name.clone(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let loop_control = control.clone();
        let handle = thread::Builder::new()
            .name(format!("msgport-recv-{}", name))
            .spawn(move || run(&loop_control, network.as_ref(), endpoint, poll, sink.as_ref()))
            .map_err(|e| IpcError::NoMemory(format!("spawn receive loop {}: {}", name, e)))?;

        *control.handle.lock() = Some(handle);
        info!("Receive loop {} started on endpoint {}", name, endpoint);
        Ok(Self { control })
    }

    pub fn is_running(&self) -> bool {
        !self.control.shutdown.load(Ordering::Acquire)
            && self
                .control
                .handle
                .lock()
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
    }

    /// Ask the loop to exit after its current poll
    pub fn request_stop(&self) {
        self.control.shutdown.store(true, Ordering::Release);
    }

    /// Block until the loop thread exits
    ///
    /// A no-op from the loop thread itself, or once already joined.
    pub fn join(&self) {
        let handle = self.control.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("Receive loop {} panicked", self.control.name);
        }
    }

    /// Stop and join
    pub fn stop(&self) {
        self.request_stop();
        self.join();
    }
}

impl Reclaim for ReceiveLoop {
    fn reclaim(self: Box<Self>) {
        self.stop();
    }
}

fn run(
    control: &LoopControl,
    network: &dyn Network,
    endpoint: EndpointId,
    poll: Duration,
    sink: &dyn EnvelopeSink,
) {
    while !control.shutdown.load(Ordering::Acquire) {
        match network.receive(endpoint, poll) {
            Ok(Some(envelope)) => {
                trace!("<- {} {:?}", endpoint, envelope.id);
                dispatch(sink, envelope);
            }
            Ok(None) => continue,
            Err(e) => {
                if !control.shutdown.load(Ordering::Acquire) {
                    error!("Receive loop {} stopping: {}", control.name, e);
                }
                break;
            }
        }
    }
    debug!("Receive loop {} exited", control.name);
}
