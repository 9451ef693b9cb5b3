//! Nonce-indexed table of in-flight requests.
//!
//! The table is a fixed power-of-two ring of optional awaiter slots.
//! `head` is the next nonce to hand out and `tail` the oldest outstanding
//! nonce; a nonce maps to slot `nonce & (capacity - 1)`. Outstanding
//! entries always form the contiguous range `[tail, head)` modulo the
//! ring: `tail` only ever advances over slots that have been vacated.
//!
//! An awaiter is the send half of a oneshot channel; the registrant keeps
//! the receive half, so the table stores a handle to notify rather than a
//! parked continuation. Deregistration rides a guard object, so a slot is
//! vacated on every exit path including cancellation.
//!
//! Tiger Style: the ring bounds in-flight requests; a full table applies
//! backpressure to registrants instead of allocating.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::constants::RPC_TABLE_CAPACITY;
use crate::error::NetError;
use crate::packet::Header;

/// A response frame delivered to a registrant.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    /// The response header; its nonce matches the request.
    pub header: Header,
    /// The response body, exactly `header.len` bytes.
    pub body: Bytes,
}

struct TableState {
    slots: Box<[Option<oneshot::Sender<ResponseFrame>>]>,
    head: u32,
    tail: u32,
}

struct TableInner {
    state: Mutex<TableState>,
    /// Wakes one registrant parked on a full table per freed slot.
    slot_freed: Notify,
    capacity: u32,
}

/// Ring of awaiters correlating responses to outstanding requests.
/// Cloning yields another handle to the same table.
#[derive(Clone)]
pub struct RpcTable {
    inner: Arc<TableInner>,
}

impl RpcTable {
    /// Table with the default capacity of [`RPC_TABLE_CAPACITY`] slots.
    pub fn new() -> Self {
        Self::with_capacity(RPC_TABLE_CAPACITY)
    }

    /// Table with `capacity` slots. `capacity` must be a power of two.
    pub fn with_capacity(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| None)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState {
                    slots,
                    head: 0,
                    tail: 0,
                }),
                slot_freed: Notify::new(),
                capacity,
            }),
        }
    }

    /// Number of outstanding entries, `head - tail` with wrapping.
    pub fn in_flight(&self) -> u32 {
        let state = self.inner.state.lock();
        state.head.wrapping_sub(state.tail)
    }

    /// Reserve the slot at `head` and return the pending request handle.
    ///
    /// Parks while the table is full, rechecking cancellation on every
    /// wake. The returned [`PendingRequest`] deregisters its slot when
    /// dropped, whether or not a response arrived.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<PendingRequest, NetError> {
        loop {
            let notified = self.inner.slot_freed.notified();
            {
                let mut state = self.inner.state.lock();
                if state.head.wrapping_sub(state.tail) < self.inner.capacity {
                    let nonce = state.head;
                    let index = (nonce & self.inner.mask()) as usize;
                    debug_assert!(state.slots[index].is_none());
                    let (tx, rx) = oneshot::channel();
                    state.slots[index] = Some(tx);
                    state.head = state.head.wrapping_add(1);
                    trace!(nonce, "registered request");
                    return Ok(PendingRequest {
                        nonce,
                        rx,
                        _guard: SlotGuard {
                            table: Arc::clone(&self.inner),
                            nonce,
                        },
                    });
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(NetError::Cancelled),
                _ = notified => {}
            }
        }
    }

    /// Route a response to its awaiter.
    ///
    /// Returns `false` for stale or forged responses: a nonce at wrapping
    /// distance `>= capacity` from `tail`, or a slot already vacated (the
    /// registrant cancelled, or the nonce was answered once before). No
    /// state changes on rejection.
    pub fn push(&self, header: Header, body: Bytes) -> bool {
        let tx = {
            let mut state = self.inner.state.lock();
            let distance = header.nonce.wrapping_sub(state.tail);
            if distance >= self.inner.capacity {
                return false;
            }
            let index = (header.nonce & self.inner.mask()) as usize;
            let Some(tx) = state.slots[index].take() else {
                return false;
            };
            self.inner.advance_tail(&mut state);
            tx
        };
        // A closed receiver means the registrant went away between the
        // take above and this send; the notification is simply dropped.
        let _ = tx.send(ResponseFrame { header, body });
        true
    }

    #[cfg(test)]
    fn tail(&self) -> u32 {
        self.inner.state.lock().tail
    }
}

impl Default for RpcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TableInner {
    fn mask(&self) -> u32 {
        self.capacity - 1
    }

    /// Advance `tail` over the contiguous null prefix, waking one parked
    /// registrant per slot freed.
    fn advance_tail(&self, state: &mut TableState) {
        while state.tail != state.head && state.slots[(state.tail & self.mask()) as usize].is_none()
        {
            state.tail = state.tail.wrapping_add(1);
            self.slot_freed.notify_one();
        }
    }

    fn deregister(&self, nonce: u32) {
        let mut state = self.state.lock();
        let distance = nonce.wrapping_sub(state.tail);
        if distance >= self.capacity {
            // Already reclaimed: the response arrived and tail moved past.
            return;
        }
        let index = (nonce & self.mask()) as usize;
        if state.slots[index].take().is_some() {
            trace!(nonce, "deregistered request");
            self.advance_tail(&mut state);
        }
    }
}

/// An outstanding request: the nonce to stamp on the wire and the handle
/// to await the response on.
pub struct PendingRequest {
    nonce: u32,
    rx: oneshot::Receiver<ResponseFrame>,
    _guard: SlotGuard,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    /// The nonce reserved for this request.
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Await the response; fails `Cancelled` when `cancel` fires first.
    /// The slot is deregistered on return, whichever way it resolves.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<ResponseFrame, NetError> {
        let PendingRequest { rx, _guard, .. } = self;
        tokio::select! {
            _ = cancel.cancelled() => Err(NetError::Cancelled),
            res = rx => res.map_err(|_| NetError::Closed),
        }
    }
}

/// Clears the registered slot on drop so every exit path deregisters.
struct SlotGuard {
    table: Arc<TableInner>,
    nonce: u32,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.deregister(self.nonce);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::packet::{Op, Tag};

    fn response(nonce: u32, body: &'static [u8]) -> (Header, Bytes) {
        (
            Header {
                len: body.len() as u32,
                nonce,
                op: Op::Response,
                tag: Tag::Ping,
            },
            Bytes::from_static(body),
        )
    }

    #[tokio::test]
    async fn nonces_are_sequential() {
        let table = RpcTable::new();
        let cancel = CancellationToken::new();
        for expected in 0..8 {
            let pending = table.register(&cancel).await.unwrap();
            assert_eq!(pending.nonce(), expected);
            // Dropping the pending request reclaims the slot, so the
            // table stays empty while head keeps advancing.
        }
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_awaiters() {
        let table = RpcTable::new();
        let cancel = CancellationToken::new();
        let p0 = table.register(&cancel).await.unwrap();
        let p1 = table.register(&cancel).await.unwrap();
        let p2 = table.register(&cancel).await.unwrap();

        for (nonce, body) in [(2, b"two".as_slice()), (0, b"zero"), (1, b"one")] {
            let (header, bytes) = response(nonce, body);
            assert!(table.push(header, bytes));
        }

        assert_eq!(p0.wait(&cancel).await.unwrap().body.as_ref(), b"zero");
        assert_eq!(p1.wait(&cancel).await.unwrap().body.as_ref(), b"one");
        assert_eq!(p2.wait(&cancel).await.unwrap().body.as_ref(), b"two");
        assert_eq!(table.tail(), 3);
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_entry_rejects_late_response() {
        let table = RpcTable::new();
        let cancel = CancellationToken::new();
        let pending = table.register(&cancel).await.unwrap();
        drop(pending);
        assert_eq!(table.tail(), 1);

        let (header, bytes) = response(0, b"late");
        assert!(!table.push(header, bytes));
        assert_eq!(table.tail(), 1);
    }

    #[tokio::test]
    async fn push_rejects_distances_beyond_capacity() {
        let table = RpcTable::with_capacity(4);
        let (header, bytes) = response(4, b"x");
        assert!(!table.push(header, bytes));
        let (header, bytes) = response(u32::MAX, b"x");
        assert!(!table.push(header, bytes));
    }

    #[tokio::test]
    async fn each_nonce_is_answered_at_most_once() {
        let table = RpcTable::new();
        let cancel = CancellationToken::new();
        let pending = table.register(&cancel).await.unwrap();

        let (header, bytes) = response(0, b"first");
        assert!(table.push(header, bytes));
        let (header, bytes) = response(0, b"second");
        assert!(!table.push(header, bytes));

        assert_eq!(pending.wait(&cancel).await.unwrap().body.as_ref(), b"first");
    }

    #[tokio::test]
    async fn full_table_parks_registrants_until_a_slot_frees() {
        let table = RpcTable::with_capacity(2);
        let cancel = CancellationToken::new();
        let p0 = table.register(&cancel).await.unwrap();
        let _p1 = table.register(&cancel).await.unwrap();

        // The third registration must not complete while the ring is full.
        let blocked = table.register(&cancel);
        tokio::pin!(blocked);
        assert!(timeout(Duration::from_millis(50), blocked.as_mut())
            .await
            .is_err());

        drop(p0);
        let p2 = timeout(Duration::from_millis(200), blocked)
            .await
            .expect("freed slot should wake the registrant")
            .unwrap();
        assert_eq!(p2.nonce(), 2);
    }

    #[tokio::test]
    async fn cancellation_unparks_a_blocked_registrant() {
        let table = RpcTable::with_capacity(2);
        let cancel = CancellationToken::new();
        let _p0 = table.register(&cancel).await.unwrap();
        let _p1 = table.register(&cancel).await.unwrap();

        let blocked = {
            let table = table.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { table.register(&cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        let err = timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, NetError::Cancelled));
    }

    #[tokio::test]
    async fn outstanding_entries_stay_contiguous() {
        let table = RpcTable::with_capacity(8);
        let cancel = CancellationToken::new();
        let mut pending = Vec::new();
        for _ in 0..6 {
            pending.push(table.register(&cancel).await.unwrap());
        }

        // Drop the middle; tail must hold until the prefix clears.
        pending.remove(2);
        assert_eq!(table.tail(), 0);
        pending.remove(0);
        assert_eq!(table.tail(), 1);
        pending.remove(0);
        // Nonces 1 and 2 are both vacant now, so tail skips to 3.
        assert_eq!(table.tail(), 3);
        assert_eq!(table.in_flight(), 3);
    }

    #[tokio::test]
    async fn wait_fails_cancelled_and_frees_the_slot() {
        let table = RpcTable::new();
        let cancel = CancellationToken::new();
        let pending = table.register(&cancel).await.unwrap();
        cancel.cancel();
        let err = pending.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, NetError::Cancelled));
        assert_eq!(table.in_flight(), 0);
    }
}
