/*!
 * Correlation Engine
 *
 * Request/ack matching by correlation id.
 *
 * # Waiter lifecycle
 *
 * ```text
 *            complete()            wait() timed out
 * PENDING ──────────────► MATCHED   PENDING ──────────► CANCELLED
 *    │
 *    └── abort_all() ───► ABORTED   (peer gone; caller gets NotConnected)
 * ```
 *
 * Every transition out of PENDING is a compare-and-swap, so exactly one
 * side wins. The receive path stores the reply only after winning, and
 * the caller that loses its cancel CAS waits for that store instead of
 * returning a timeout. A reply that loses comes back from `complete` to
 * be dropped by the receive path. Either way it is dropped exactly once.
 *
 * The caller always evicts its own waiter from the table (on drop), so
 * the receive path never frees anything it did not create.
 */

use crate::core::errors::{IpcError, IpcResult, StatusCode};
use crate::core::limits::FIRST_CORRELATION_ID;
use crate::core::memory::SlotPool;
use crate::core::sync::Event;
use crate::core::types::{now_ms, CorrelationId, EndpointId, SlotIndex};
use crate::ipc::envelope::{ControlPayload, Envelope, Features, MessageId};
use crate::ipc::transport::Network;
use crate::monitoring::{ProtocolStats, RequestSpan};
use ahash::RandomState;
use bytes::Bytes;
use log::{trace, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const MATCHED: u8 = 1;
const CANCELLED: u8 = 2;
const ABORTED: u8 = 3;

struct AckWaiter<R> {
    correlation_id: CorrelationId,
    state: AtomicU8,
    event: Event,
    reply: Mutex<Option<R>>,
}

impl<R> AckWaiter<R> {
    fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            state: AtomicU8::new(PENDING),
            event: Event::new(),
            reply: Mutex::new(None),
        }
    }

    #[inline]
    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Outcome of offering a reply to the table
#[derive(Debug)]
pub enum AckMatch<R> {
    /// Handed to the waiting caller
    Delivered,
    /// Caller already timed out; reply returned for disposal
    Late(R),
    /// No waiter with that correlation id; reply returned for disposal
    Unknown(R),
}

struct AckIndex<R> {
    pool: SlotPool<Arc<AckWaiter<R>>>,
    by_correlation: HashMap<CorrelationId, SlotIndex, RandomState>,
    next_id: CorrelationId,
}

/// Outstanding-request table: waiter pool, id index and id counter under one lock
pub struct AckTable<R> {
    index: Mutex<AckIndex<R>>,
}

impl<R: Send> AckTable<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            index: Mutex::new(AckIndex {
                pool: SlotPool::new(capacity),
                by_correlation: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
                next_id: FIRST_CORRELATION_ID,
            }),
        }
    }

    /// Assign the next correlation id and park a waiter for it
    ///
    /// Fails with `ResourceExhausted` when every waiter slot is taken.
    pub fn register(&self) -> IpcResult<PendingAck<'_, R>> {
        let mut index = self.index.lock();
        let correlation_id = index.next_id;
        let waiter = Arc::new(AckWaiter::new(correlation_id));
        let slot = index.pool.allocate(waiter.clone())?;
        index.by_correlation.insert(correlation_id, slot);
        index.next_id = match correlation_id.wrapping_add(1) {
            0 => FIRST_CORRELATION_ID,
            next => next,
        };
        Ok(PendingAck {
            table: self,
            waiter,
            slot,
        })
    }

    /// Offer `reply` to the waiter registered under `correlation_id`
    pub fn complete(&self, correlation_id: CorrelationId, reply: R) -> AckMatch<R> {
        let waiter = {
            let index = self.index.lock();
            index
                .by_correlation
                .get(&correlation_id)
                .and_then(|slot| index.pool.get(*slot))
                .cloned()
        };
        let Some(waiter) = waiter else {
            return AckMatch::Unknown(reply);
        };
        if !waiter.transition(MATCHED) {
            return AckMatch::Late(reply);
        }
        *waiter.reply.lock() = Some(reply);
        waiter.event.signal();
        AckMatch::Delivered
    }

    /// Fail every pending waiter; callers see `NotConnected`
    pub fn abort_all(&self) -> usize {
        let waiters: Vec<Arc<AckWaiter<R>>> = {
            let index = self.index.lock();
            index.pool.iter_active().map(|(_, w)| w.clone()).collect()
        };
        let mut aborted = 0;
        for waiter in waiters {
            if waiter.transition(ABORTED) {
                waiter.event.signal();
                aborted += 1;
            }
        }
        aborted
    }

    /// Waiters currently registered
    pub fn pending(&self) -> usize {
        self.index.lock().pool.len()
    }

    pub fn capacity(&self) -> usize {
        self.index.lock().pool.capacity()
    }

    fn evict(&self, slot: SlotIndex, correlation_id: CorrelationId) {
        let mut index = self.index.lock();
        index.by_correlation.remove(&correlation_id);
        index.pool.free(slot);
    }
}

/// A registered waiter; evicted from its table when dropped
pub struct PendingAck<'a, R: Send> {
    table: &'a AckTable<R>,
    waiter: Arc<AckWaiter<R>>,
    slot: SlotIndex,
}

impl<'a, R: Send> PendingAck<'a, R> {
    #[inline]
    pub fn correlation_id(&self) -> CorrelationId {
        self.waiter.correlation_id
    }

    /// Block until the reply arrives, the table is aborted, or `timeout` passes
    pub fn wait(self, timeout: Duration) -> IpcResult<R> {
        let start = Instant::now();
        if !self.waiter.event.wait_timeout(timeout) {
            if self.waiter.transition(CANCELLED) {
                return Err(IpcError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            // Lost the cancel race; the winner signals right after its store
            self.waiter.event.wait();
        }

        match self.waiter.state.load(Ordering::Acquire) {
            MATCHED => self
                .waiter
                .reply
                .lock()
                .take()
                .ok_or_else(|| IpcError::Internal("matched waiter holds no reply".into())),
            ABORTED => Err(IpcError::NotConnected("peer went away before replying".into())),
            state => Err(IpcError::Internal(format!("waiter woke in state {}", state))),
        }
    }
}

impl<'a, R: Send> Drop for PendingAck<'a, R> {
    fn drop(&mut self) {
        // Unwaited waiters (send failed) must not accept a reply after eviction
        self.waiter.transition(CANCELLED);
        self.table.evict(self.slot, self.waiter.correlation_id);
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Reply leg of a request as seen by the requester
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub control: ControlPayload,
    pub payload: Bytes,
}

impl Ack {
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.control.status
    }
}

/// An ack nobody was waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LateAck {
    pub correlation_id: CorrelationId,
    pub ack: Ack,
}

/// Sends requests, matches acks, and sends acks, for one local endpoint
pub struct CorrelationEngine {
    network: Arc<dyn Network>,
    local: EndpointId,
    acks: AckTable<Ack>,
    stats: Arc<ProtocolStats>,
    send_timeout: Duration,
}

impl CorrelationEngine {
    pub fn new(
        network: Arc<dyn Network>,
        local: EndpointId,
        max_pending: usize,
        send_timeout: Duration,
        stats: Arc<ProtocolStats>,
    ) -> Self {
        Self {
            network,
            local,
            acks: AckTable::new(max_pending),
            stats,
            send_timeout,
        }
    }

    #[inline]
    pub fn local_endpoint(&self) -> EndpointId {
        self.local
    }

    fn transmit(&self, destination: EndpointId, envelope: Envelope) -> IpcResult<()> {
        trace!("-> {} {:?}", destination, envelope.id);
        match self.network.send(destination, envelope, self.send_timeout) {
            Ok(()) => {
                self.stats.record_sent();
                Ok(())
            }
            Err(e) => {
                self.stats.record_send_failure();
                Err(match e {
                    IpcError::SendFailed(_) => e,
                    other => IpcError::SendFailed(other.to_string()),
                })
            }
        }
    }

    /// Fire-and-forget; any ack flags on `id` are stripped
    pub fn send(
        &self,
        destination: EndpointId,
        id: MessageId,
        control: ControlPayload,
        payload: Bytes,
    ) -> IpcResult<()> {
        let control = ControlPayload {
            correlation_id: 0,
            ..control
        };
        let id = id.clear(Features::WANTS_ACK | Features::IS_ACK);
        let envelope = Envelope::new(id, &control, payload)?.with_reply_to(self.local);
        self.transmit(destination, envelope)
    }

    /// Send a request and block for its ack
    ///
    /// A send failure returns at once; nothing is left registered.
    pub fn send_with_ack(
        &self,
        destination: EndpointId,
        id: MessageId,
        control: ControlPayload,
        payload: Bytes,
        timeout: Duration,
    ) -> IpcResult<Ack> {
        let pending = self.acks.register()?;
        let correlation_id = pending.correlation_id();
        let span = RequestSpan::new(correlation_id, id.message_type());

        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let control = ControlPayload {
            correlation_id,
            deadline_ms: Some(now_ms().saturating_add(timeout_ms)),
            ..control
        };
        let envelope = Envelope::new(id.as_request(), &control, payload)?.with_reply_to(self.local);

        if let Err(e) = self.transmit(destination, envelope) {
            span.record_result("send_failed");
            return Err(e);
        }

        match pending.wait(timeout) {
            Ok(ack) => {
                span.record_result("matched");
                Ok(ack)
            }
            Err(e) => {
                if e.is_timeout() {
                    self.stats.record_timeout();
                    warn!("Request {} to endpoint {} timed out", correlation_id, destination);
                }
                span.record_result("failed");
                Err(e)
            }
        }
    }

    /// Match an inbound ack; returns it back if nobody was waiting
    pub fn handle_ack(&self, envelope: Envelope) -> Option<LateAck> {
        let control = match envelope.control() {
            Ok(control) if control.correlation_id != 0 => control,
            Ok(_) => {
                self.stats.record_protocol_violation();
                warn!("Discarding ack without correlation id {:?}", envelope.id);
                return None;
            }
            Err(e) => {
                self.stats.record_protocol_violation();
                warn!("Discarding malformed ack: {}", e);
                return None;
            }
        };

        let correlation_id = control.correlation_id;
        let ack = Ack {
            control,
            payload: envelope.payload,
        };
        match self.acks.complete(correlation_id, ack) {
            AckMatch::Delivered => {
                self.stats.record_ack_matched();
                None
            }
            AckMatch::Late(ack) => {
                self.stats.record_late_ack();
                warn!("Late ack for request {} discarded; caller already timed out", correlation_id);
                Some(LateAck { correlation_id, ack })
            }
            AckMatch::Unknown(ack) => {
                self.stats.record_unknown_ack();
                warn!("Ack for unknown request {} discarded", correlation_id);
                Some(LateAck { correlation_id, ack })
            }
        }
    }

    /// Answer `request` with the same correlation id
    pub fn send_ack(
        &self,
        destination: EndpointId,
        request_id: MessageId,
        request: &ControlPayload,
        status: StatusCode,
        payload: Bytes,
    ) -> IpcResult<()> {
        let control = ControlPayload {
            status,
            deadline_ms: None,
            ..*request
        };
        let envelope = Envelope::new(request_id.as_ack(), &control, payload)?.with_reply_to(self.local);
        self.transmit(destination, envelope)
    }

    /// Wake every blocked caller with `NotConnected`
    pub fn abort_all(&self) -> usize {
        self.acks.abort_all()
    }

    pub fn pending(&self) -> usize {
        self.acks.pending()
    }
}
