//! Stream id allocation and response correlation.
//!
//! Each connection owns one [`StreamMultiplexer`]. Callers allocate a stream
//! id and get back a [`PendingRequest`] to await; the read loop resolves ids
//! as responses arrive.
//!
//! # Slot lifecycle
//!
//! ```text
//!            allocate                 resolve
//!   Free ─────────────► InFlight ─────────────────► Free
//!                          │
//!                          │ timeout / cancel / sweep
//!                          ▼
//!                      Abandoned ──── late response ───► Free
//! ```
//!
//! An abandoned id is not reused until its response arrives (or the
//! connection is aborted), so a late response can never reach the next
//! owner of the id. A response for a `Free` id was never asked for and is
//! reported as [`WireError::OrphanedResponse`].
//!
//! Abandoned ids are counted. Once half the pool is abandoned the
//! multiplexer reports itself [saturated](StreamMultiplexer::is_saturated)
//! and the connection owning it is expected to close, which returns every
//! id through [`abort_all`](StreamMultiplexer::abort_all).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::error::{Result, WireError};
use crate::response::Response;

type ResponseSender = oneshot::Sender<Result<Response>>;

enum Slot {
    Free,
    InFlight {
        tx: ResponseSender,
        generation: u64,
        deadline: Instant,
        timeout: Duration,
    },
    Abandoned,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<i16>,
    abandoned: usize,
    next_generation: u64,
    closed: bool,
}

fn owns(slot: &Slot, generation: u64) -> bool {
    matches!(slot, Slot::InFlight { generation: g, .. } if *g == generation)
}

/// What happened to a resolved response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller had already given up; the response was dropped.
    Discarded,
}

/// Per-connection stream id pool and pending-slot table.
pub struct StreamMultiplexer {
    inner: Mutex<Slots>,
    capacity: usize,
    /// Number of `InFlight` slots.
    in_flight: AtomicUsize,
    idle: Notify,
}

impl StreamMultiplexer {
    /// Create a pool of `capacity` ids, `0..capacity`.
    ///
    /// `capacity` is clamped to the 16-bit id space.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, i16::MAX as usize + 1);
        let slots = (0..capacity).map(|_| Slot::Free).collect();
        // Popped from the back, so id 0 goes out first.
        let free = (0..capacity).rev().map(|id| id as i16).collect();
        Self {
            inner: Mutex::new(Slots {
                slots,
                free,
                abandoned: 0,
                next_generation: 0,
                closed: false,
            }),
            capacity,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // Slot state stays consistent across a panicking holder.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a stream id whose response must arrive within `timeout`.
    ///
    /// # Errors
    ///
    /// `ExhaustedStreamIds` when every id is taken, `ConnectionClosed` after
    /// [`abort_all`](Self::abort_all).
    pub fn allocate(self: &Arc<Self>, timeout: Duration) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        let mut inner = self.lock();
        if inner.closed {
            return Err(WireError::ConnectionClosed);
        }
        let stream_id = match inner.free.pop() {
            Some(id) => id,
            None => return Err(WireError::ExhaustedStreamIds(self.capacity)),
        };
        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.slots[stream_id as usize] = Slot::InFlight {
            tx,
            generation,
            deadline,
            timeout,
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        drop(inner);

        tracing::trace!(stream_id, "stream id allocated");

        Ok(PendingRequest {
            mux: Arc::clone(self),
            stream_id,
            generation,
            deadline,
            timeout,
            rx,
            finished: false,
        })
    }

    /// Hand a response (or an error for this stream) to its waiter and free
    /// the id.
    ///
    /// Only the connection's read loop calls this.
    ///
    /// # Errors
    ///
    /// `OrphanedResponse` when no request is outstanding on `stream_id`.
    /// Other slots are unaffected.
    pub fn resolve(&self, stream_id: i16, result: Result<Response>) -> Result<Resolution> {
        let idx = usize::try_from(stream_id)
            .ok()
            .filter(|&i| i < self.capacity)
            .ok_or(WireError::OrphanedResponse(stream_id))?;

        let mut inner = self.lock();
        let resolution = match std::mem::replace(&mut inner.slots[idx], Slot::Free) {
            Slot::Free => return Err(WireError::OrphanedResponse(stream_id)),
            Slot::InFlight { tx, .. } => {
                // Sent under the lock so a concurrent timeout sees either
                // InFlight (and abandons) or a filled channel.
                let delivered = tx.send(result).is_ok();
                self.finish_one();
                if delivered {
                    Resolution::Delivered
                } else {
                    Resolution::Discarded
                }
            }
            Slot::Abandoned => {
                inner.abandoned -= 1;
                Resolution::Discarded
            }
        };
        inner.free.push(stream_id);
        drop(inner);

        tracing::trace!(stream_id, ?resolution, "stream id resolved");
        Ok(resolution)
    }

    /// Give up on `stream_id` if it still belongs to `generation`.
    ///
    /// Returns false when the slot was already resolved.
    fn abandon(&self, stream_id: i16, generation: u64) -> bool {
        let idx = stream_id as usize;
        let mut inner = self.lock();
        if !owns(&inner.slots[idx], generation) {
            return false;
        }
        inner.slots[idx] = Slot::Abandoned;
        inner.abandoned += 1;
        self.finish_one();
        drop(inner);

        tracing::debug!(stream_id, "stream id abandoned, awaiting late response");
        true
    }

    /// Free an id whose request never reached the socket.
    fn release_unsent(&self, stream_id: i16, generation: u64) {
        let idx = stream_id as usize;
        let mut inner = self.lock();
        if owns(&inner.slots[idx], generation) {
            inner.slots[idx] = Slot::Free;
            inner.free.push(stream_id);
            self.finish_one();
        }
    }

    /// Fail every outstanding request with `reason` and refuse new ones.
    ///
    /// Returns the number of callers notified.
    pub fn abort_all(&self, reason: WireError) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let mut aborted = 0;
        for slot in inner.slots.iter_mut() {
            if let Slot::InFlight { tx, .. } = std::mem::replace(slot, Slot::Free) {
                let _ = tx.send(Err(reason.clone()));
                aborted += 1;
            }
        }
        let capacity = self.capacity;
        inner.free = (0..capacity).rev().map(|id| id as i16).collect();
        inner.abandoned = 0;
        self.in_flight.store(0, Ordering::Release);
        drop(inner);

        self.idle.notify_waiters();
        if aborted > 0 {
            tracing::debug!(aborted, %reason, "aborted in-flight requests");
        }
        aborted
    }

    /// Time out every slot whose deadline is at or before `now`.
    ///
    /// A backstop for the per-request timers; expired waiters receive
    /// `Timeout` and their ids stay reserved until the late response arrives.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let mut expired = 0;
        for slot in inner.slots.iter_mut() {
            let is_expired = matches!(slot, Slot::InFlight { deadline, .. } if *deadline <= now);
            if !is_expired {
                continue;
            }
            if let Slot::InFlight { tx, timeout, .. } = std::mem::replace(slot, Slot::Abandoned) {
                let _ = tx.send(Err(WireError::Timeout(timeout)));
                expired += 1;
            }
        }
        inner.abandoned += expired;
        let remaining = self.in_flight.fetch_sub(expired, Ordering::AcqRel) - expired;
        drop(inner);

        if expired > 0 {
            if remaining == 0 {
                self.idle.notify_waiters();
            }
            tracing::debug!(expired, "swept expired requests");
        }
        expired
    }

    /// Callers hold the slot lock.
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Requests awaiting a response.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Ids held back for responses whose callers gave up.
    pub fn abandoned(&self) -> usize {
        self.lock().abandoned
    }

    /// Abandoned ids at which the pool counts as saturated.
    #[inline]
    pub fn abandon_limit(&self) -> usize {
        (self.capacity / 2).max(1)
    }

    /// True once [`abandon_limit`](Self::abandon_limit) ids are abandoned.
    ///
    /// A server that never answers would otherwise drain the pool one
    /// timeout at a time.
    pub fn is_saturated(&self) -> bool {
        self.abandoned() >= self.abandon_limit()
    }

    /// Ids that can be allocated right now.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Size of the id pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait until no request is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A caller's claim on one stream id.
///
/// Dropping it before completion abandons the id: a response that arrives
/// later is discarded.
#[derive(Debug)]
pub struct PendingRequest {
    mux: Arc<StreamMultiplexer>,
    stream_id: i16,
    generation: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Response>>,
    finished: bool,
}

impl PendingRequest {
    /// Allocated stream id.
    #[inline]
    pub fn stream_id(&self) -> i16 {
        self.stream_id
    }

    /// Instant after which the request times out.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the response, or `Timeout` once the deadline passes.
    ///
    /// Exactly one outcome is produced: if the timer and the response race,
    /// whichever claims the slot first wins.
    pub async fn wait(mut self) -> Result<Response> {
        let outcome = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_) => {
                if self.mux.abandon(self.stream_id, self.generation) {
                    Err(WireError::Timeout(self.timeout))
                } else {
                    // Resolved between the timer firing and the abandon.
                    self.rx.try_recv().unwrap_or(Err(WireError::ConnectionClosed))
                }
            }
        };
        self.finished = true;
        outcome
    }

    /// Return the id straight to the pool; for requests that were never written.
    pub fn release_unsent(mut self) {
        self.mux.release_unsent(self.stream_id, self.generation);
        self.finished = true;
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished {
            self.mux.abandon(self.stream_id, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use std::collections::HashSet;

    fn ready(stream_id: i16) -> Result<Response> {
        Ok(Response {
            stream_id,
            trace_id: None,
            warnings: None,
            custom_payload: None,
            body: ResponseBody::Ready,
        })
    }

    const LONG: Duration = Duration::from_secs(60);

    #[test]
    fn test_ids_start_at_zero() {
        let mux = Arc::new(StreamMultiplexer::new(8));
        let a = mux.allocate(LONG).unwrap();
        let b = mux.allocate(LONG).unwrap();
        assert_eq!(a.stream_id(), 0);
        assert_eq!(b.stream_id(), 1);
        assert_eq!(mux.in_flight(), 2);
        assert_eq!(mux.available(), 6);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let mux = Arc::new(StreamMultiplexer::new(1024));
        let ids: Vec<i16> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let mux = mux.clone();
                    s.spawn(move || {
                        (0..128)
                            .map(|_| {
                                let pending = mux.allocate(LONG).unwrap();
                                let id = pending.stream_id();
                                std::mem::forget(pending);
                                id
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(ids.len(), 1024);
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 1024);
        assert!(matches!(
            mux.allocate(LONG),
            Err(WireError::ExhaustedStreamIds(1024))
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_and_reuse() {
        let mux = Arc::new(StreamMultiplexer::new(4));
        let pending: Vec<_> = (0..4).map(|_| mux.allocate(LONG).unwrap()).collect();
        assert!(matches!(
            mux.allocate(LONG),
            Err(WireError::ExhaustedStreamIds(4))
        ));

        let freed = pending[2].stream_id();
        assert_eq!(mux.resolve(freed, ready(freed)).unwrap(), Resolution::Delivered);

        let again = mux.allocate(LONG).unwrap();
        assert_eq!(again.stream_id(), freed);
        assert!(mux.allocate(LONG).is_err());
    }

    #[tokio::test]
    async fn test_response_reaches_waiter() {
        let mux = Arc::new(StreamMultiplexer::new(4));
        let pending = mux.allocate(LONG).unwrap();
        let id = pending.stream_id();
        mux.resolve(id, ready(id)).unwrap();

        let response = pending.wait().await.unwrap();
        assert_eq!(response.stream_id, id);
        assert_eq!(mux.in_flight(), 0);
        assert_eq!(mux.available(), 4);
    }

    #[tokio::test]
    async fn test_orphan_does_not_disturb_others() {
        let mux = Arc::new(StreamMultiplexer::new(4));
        let pending = mux.allocate(LONG).unwrap();

        assert!(matches!(
            mux.resolve(3, ready(3)),
            Err(WireError::OrphanedResponse(3))
        ));
        assert!(matches!(
            mux.resolve(-5, ready(-5)),
            Err(WireError::OrphanedResponse(-5))
        ));
        assert!(matches!(
            mux.resolve(400, ready(400)),
            Err(WireError::OrphanedResponse(400))
        ));

        let id = pending.stream_id();
        mux.resolve(id, ready(id)).unwrap();
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response() {
        let mux = Arc::new(StreamMultiplexer::new(2));
        let pending = mux.allocate(Duration::from_millis(100)).unwrap();
        let id = pending.stream_id();

        let result = pending.wait().await;
        assert!(matches!(result, Err(WireError::Timeout(d)) if d == Duration::from_millis(100)));

        // Abandoned: still reserved, not in flight.
        assert_eq!(mux.in_flight(), 0);
        assert_eq!(mux.available(), 1);
        assert_eq!(mux.abandoned(), 1);

        assert_eq!(mux.resolve(id, ready(id)).unwrap(), Resolution::Discarded);
        assert_eq!(mux.available(), 2);
        assert_eq!(mux.abandoned(), 0);

        // The id is clean for the next caller.
        let next = mux.allocate(LONG).unwrap();
        let next_id = next.stream_id();
        mux.resolve(next_id, ready(next_id)).unwrap();
        assert!(next.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_just_before_deadline_wins() {
        let mux = Arc::new(StreamMultiplexer::new(2));
        let pending = mux.allocate(Duration::from_millis(100)).unwrap();
        let id = pending.stream_id();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(mux.resolve(id, ready(id)).unwrap(), Resolution::Delivered);
        tokio::time::advance(Duration::from_millis(5)).await;

        assert!(pending.wait().await.is_ok());
        assert!(matches!(
            mux.resolve(id, ready(id)),
            Err(WireError::OrphanedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_discards_late_response() {
        let mux = Arc::new(StreamMultiplexer::new(2));
        let pending = mux.allocate(LONG).unwrap();
        let id = pending.stream_id();

        let task = tokio::spawn(pending.wait());
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        assert_eq!(mux.in_flight(), 0);
        assert_eq!(mux.resolve(id, ready(id)).unwrap(), Resolution::Discarded);
        assert_eq!(mux.available(), 2);
    }

    #[tokio::test]
    async fn test_release_unsent() {
        let mux = Arc::new(StreamMultiplexer::new(2));
        let pending = mux.allocate(LONG).unwrap();
        let id = pending.stream_id();
        pending.release_unsent();

        assert_eq!(mux.available(), 2);
        assert!(matches!(
            mux.resolve(id, ready(id)),
            Err(WireError::OrphanedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_all_resolves_everyone() {
        let mux = Arc::new(StreamMultiplexer::new(8));
        let pending: Vec<_> = (0..3).map(|_| mux.allocate(LONG).unwrap()).collect();

        let aborted = mux.abort_all(WireError::ConnectionAborted("socket reset".into()));
        assert_eq!(aborted, 3);

        for p in pending {
            match p.wait().await {
                Err(WireError::ConnectionAborted(reason)) => assert_eq!(&*reason, "socket reset"),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(mux.in_flight(), 0);
        assert_eq!(mux.available(), 8);
        assert!(matches!(mux.allocate(LONG), Err(WireError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let mux = Arc::new(StreamMultiplexer::new(4));
        let short = mux.allocate(Duration::from_millis(10)).unwrap();
        let long = mux.allocate(LONG).unwrap();

        assert_eq!(mux.sweep_expired(Instant::now()), 0);
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(mux.sweep_expired(Instant::now()), 1);

        assert!(matches!(short.wait().await, Err(WireError::Timeout(_))));
        assert_eq!(mux.in_flight(), 1);

        let id = long.stream_id();
        mux.resolve(id, ready(id)).unwrap();
        assert!(long.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let mux = Arc::new(StreamMultiplexer::new(4));
        mux.wait_idle().await;

        let pending = mux.allocate(LONG).unwrap();
        let id = pending.stream_id();
        let waiter = {
            let mux = mux.clone();
            tokio::spawn(async move { mux.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        mux.resolve(id, ready(id)).unwrap();
        waiter.await.unwrap();
        drop(pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_timeouts_saturate_pool() {
        let mux = Arc::new(StreamMultiplexer::new(4));
        assert_eq!(mux.abandon_limit(), 2);

        let first = mux.allocate(Duration::from_millis(10)).unwrap();
        assert!(matches!(first.wait().await, Err(WireError::Timeout(_))));
        assert!(!mux.is_saturated());

        // Swept rather than awaited: the sweep counts toward the limit too.
        let _second = mux.allocate(Duration::from_millis(10)).unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(mux.sweep_expired(Instant::now()), 1);

        assert_eq!(mux.in_flight(), 0);
        assert_eq!(mux.available(), 2);
        assert!(mux.is_saturated());

        // Aborting hands every id back.
        mux.abort_all(WireError::ConnectionAborted("too many abandoned ids".into()));
        assert_eq!(mux.abandoned(), 0);
        assert_eq!(mux.available(), 4);
    }

    #[test]
    fn test_capacity_clamped() {
        assert_eq!(StreamMultiplexer::new(100_000).capacity(), 32_768);
        assert_eq!(StreamMultiplexer::new(0).capacity(), 1);
    }
}
