//! Lock-free multi-producer single-consumer mailbox queue.
//!
//! Each actor owns exactly one [`Mbox`]. Any number of producer threads
//! may [`push`](Mbox::push) concurrently; only the owning actor's
//! thread holds the [`MboxConsumer`] and drains it. The algorithm is
//! the Michael–Scott linked queue with a permanent sentinel node, with
//! one change: instead of a double-width `{pointer, counter}` atomic,
//! links are a [`Tag`] packing `{u32 slot index, u32 count}` into a
//! single `AtomicU64` over a slot arena. Slots are recycled through a
//! versioned free stack but their memory is never released while the
//! mailbox lives, so a stale tag is a checked miss, never a dangling
//! pointer.
//!
//! The count half of every queue tag comes from a per-mailbox
//! monotonically increasing sequence, fresh for every link and swing
//! attempt, so no two attempts ever carry an equal tag for different
//! nodes. That is the ABA defense: a compare-and-swap against a slot
//! that was freed and reallocated in the meantime fails on the count
//! even when the slot index matches. The count wraps at `u32::MAX`; a
//! stalled producer would have to sleep through four billion link
//! operations on one mailbox to be fooled, which the engine does not
//! consider a reachable state.
//!
//! # Memory ordering
//!
//! Queue-state atomics (`tail`, `current`, slot `next` fields, the
//! free-stack head) all use `SeqCst`, matching the C++ default the
//! algorithm was designed against. Segment publication uses
//! `Release`/`Acquire` pairing on its own.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;
use types::Message;

/// Slot-index value meaning "no node".
const NIL_SLOT: u32 = u32::MAX;

/// Slots in segment 0; segment `k` holds `SEGMENT_BASE << k` slots.
const SEGMENT_BASE: usize = 64;

/// 64 * (2^25 - 1) ≈ 2.1 billion slots before the arena is exhausted.
const MAX_SEGMENTS: usize = 25;

/// A tagged slot reference: `{slot index, count}` packed into one
/// 64-bit word so it can be compared-and-swapped atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag(u64);

impl Tag {
    fn new(slot: u32, count: u32) -> Self {
        Tag(((slot as u64) << 32) | count as u64)
    }

    fn nil(count: u32) -> Self {
        Self::new(NIL_SLOT, count)
    }

    fn slot(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn count(self) -> u32 {
        self.0 as u32
    }

    fn is_nil(self) -> bool {
        self.slot() == NIL_SLOT
    }
}

/// One arena slot: a queue node. `next` doubles as the free-stack link
/// while the slot is unallocated.
struct Slot {
    next: AtomicU64,
    msg: UnsafeCell<Option<Message>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(Tag::nil(0).0),
            msg: UnsafeCell::new(None),
        }
    }
}

/// Segmented slot arena with a lock-free free stack.
///
/// Segments are published once via `AtomicPtr` and stay mapped until
/// the arena drops, so `slot()` lookups never race with deallocation.
/// Growth (allocating the next segment) takes a mutex, but only runs
/// when the free stack is empty, never on the steady-state path.
struct Slab {
    segments: [AtomicPtr<Slot>; MAX_SEGMENTS],
    /// Head of the free stack: `Tag{slot, version}`. The version half
    /// is bumped on every successful pop/push to defeat ABA on the
    /// stack itself. Free-stack links always carry count 0, which no
    /// live queue tag ever does (see [`Mbox::fresh_count`]).
    free: AtomicU64,
    /// Number of segments allocated so far; also serializes growth.
    grown: Mutex<usize>,
}

fn segment_len(seg: usize) -> usize {
    SEGMENT_BASE << seg
}

fn segment_start(seg: usize) -> usize {
    SEGMENT_BASE * ((1usize << seg) - 1)
}

/// Decompose a slot index into `(segment, offset)`.
fn locate(slot: u32) -> (usize, usize) {
    let n = slot as usize / SEGMENT_BASE + 1;
    let seg = (usize::BITS - 1 - n.leading_zeros()) as usize;
    (seg, slot as usize - segment_start(seg))
}

impl Slab {
    fn new() -> Self {
        let slab = Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            free: AtomicU64::new(Tag::nil(0).0),
            grown: Mutex::new(0),
        };
        slab.grow();
        slab
    }

    fn slot(&self, slot: u32) -> &Slot {
        let (seg, off) = locate(slot);
        let base = self.segments[seg].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "slot index from unpublished segment");
        // SAFETY: a slot index only circulates after its segment was
        // published (Release store in grow), and segments are not
        // deallocated until the slab drops.
        unsafe { &*base.add(off) }
    }

    /// Pop a free slot, growing the arena if the free stack is empty.
    fn alloc(&self) -> u32 {
        loop {
            let head = Tag(self.free.load(Ordering::SeqCst));
            if head.is_nil() {
                self.grow();
                continue;
            }
            let next = Tag(self.slot(head.slot()).next.load(Ordering::SeqCst));
            let replacement = Tag::new(next.slot(), head.count().wrapping_add(1));
            if self
                .free
                .compare_exchange(head.0, replacement.0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return head.slot();
            }
        }
    }

    /// Push a slot back onto the free stack. Called by the single
    /// consumer (and by growth, for freshly allocated slots).
    fn release(&self, slot: u32) {
        loop {
            let head = Tag(self.free.load(Ordering::SeqCst));
            self.slot(slot)
                .next
                .store(Tag::new(head.slot(), 0).0, Ordering::SeqCst);
            let replacement = Tag::new(slot, head.count().wrapping_add(1));
            if self
                .free
                .compare_exchange(head.0, replacement.0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Allocate the next segment and thread its slots onto the free
    /// stack. Allocation failure aborts, per the engine's resource
    /// exhaustion policy.
    fn grow(&self) {
        let mut grown = self.grown.lock();
        // Another thread may have grown while we waited for the lock.
        if !Tag(self.free.load(Ordering::SeqCst)).is_nil() {
            return;
        }
        let seg = *grown;
        assert!(seg < MAX_SEGMENTS, "mailbox slot arena exhausted");
        let len = segment_len(seg);
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, Slot::new);
        let base = Box::into_raw(slots.into_boxed_slice()) as *mut Slot;
        self.segments[seg].store(base, Ordering::Release);
        *grown = seg + 1;

        let start = segment_start(seg) as u32;
        for i in 0..len as u32 {
            self.release(start + i);
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let grown = *self.grown.get_mut();
        for seg in 0..grown {
            let base = *self.segments[seg].get_mut();
            if base.is_null() {
                continue;
            }
            let len = segment_len(seg);
            // SAFETY: published by grow() from Box<[Slot]>::into_raw
            // with exactly this length; dropping releases any messages
            // still queued at teardown.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)));
            }
        }
    }
}

/// How long [`MboxConsumer::recv`] waits on an empty mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait until a message arrives. This is a spin/yield wait:
    /// producers never signal, so there is nothing to sleep on.
    Block,
    /// Return `None` immediately.
    Immediate,
    /// Sleep once for up to this many microseconds, then return
    /// `None` without re-checking the queue. A message that arrives
    /// during the sleep is picked up by the next call, not this one:
    /// deliberate latency slack, kept from the reference behavior.
    Micros(u64),
}

/// One actor's inbox: the shared half of the mailbox.
///
/// Producers reach it through `Arc<Mbox>` (usually wrapped in an
/// `MboxProducer`); the dequeue side lives solely on [`MboxConsumer`].
pub struct Mbox {
    slab: Slab,
    /// Tag of the last linked node. Producers append after it.
    tail: AtomicU64,
    /// Consumer cursor: the node most recently delivered. Only the
    /// consumer stores to it.
    current: AtomicU64,
    /// Source of fresh tag counts.
    counter: AtomicU64,
}

// SAFETY: the only non-Sync state is the per-slot message cell. A cell
// is written by exactly one producer while the slot is still private
// (freshly popped from the free stack, not yet linked), and read by
// the single consumer only after it observes the SeqCst link CAS that
// published the slot. Messages themselves are Send.
unsafe impl Send for Mbox {}
unsafe impl Sync for Mbox {}

impl Mbox {
    /// Create a mailbox. Returns the consumer handle for the owning
    /// actor and the shared core that producers bind to.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (MboxConsumer, Arc<Mbox>) {
        let slab = Slab::new();
        let sentinel = slab.alloc();
        // Count 1 for the sentinel's empty next: count 0 is the
        // free-stack link marker and must never appear on a live tag.
        slab.slot(sentinel).next.store(Tag::nil(1).0, Ordering::SeqCst);
        let origin = Tag::new(sentinel, 1);
        let mbox = Arc::new(Mbox {
            slab,
            tail: AtomicU64::new(origin.0),
            current: AtomicU64::new(origin.0),
            counter: AtomicU64::new(2),
        });
        (
            MboxConsumer {
                mbox: Arc::clone(&mbox),
            },
            mbox,
        )
    }

    /// Next tag count. Never returns 0: count 0 is reserved for
    /// free-stack links, so a parked free slot can never compare equal
    /// to a live queue link.
    fn fresh_count(&self) -> u32 {
        loop {
            let count = self.counter.fetch_add(1, Ordering::SeqCst) as u32;
            if count != 0 {
                return count;
            }
        }
    }

    /// Append a message. Lock-free: callable from any number of
    /// threads concurrently, resolves contention purely by retry and
    /// never suspends the caller.
    pub fn push(&self, msg: Message) {
        let slot = self.slab.alloc();
        // SAFETY: the slot is private until the link CAS below; no
        // other thread can read the cell.
        unsafe {
            *self.slab.slot(slot).msg.get() = Some(msg);
        }
        self.slab
            .slot(slot)
            .next
            .store(Tag::nil(self.fresh_count()).0, Ordering::SeqCst);

        loop {
            let tail = Tag(self.tail.load(Ordering::SeqCst));
            let next = Tag(self.slab.slot(tail.slot()).next.load(Ordering::SeqCst));
            if tail.0 != self.tail.load(Ordering::SeqCst) {
                // Tail moved while we were reading its next field.
                continue;
            }
            if next.is_nil() {
                // Tail really is last: link after it.
                let fresh = Tag::new(slot, self.fresh_count());
                if self
                    .slab
                    .slot(tail.slot())
                    .next
                    .compare_exchange(next.0, fresh.0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    // Linked; the enqueue is complete. Swinging the
                    // shared tail forward is best-effort; losing this
                    // race means another thread already did it.
                    let swing = Tag::new(slot, self.fresh_count());
                    let _ = self.tail.compare_exchange(
                        tail.0,
                        swing.0,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    return;
                }
            } else {
                if next.slot() == tail.slot() {
                    // A node can never be its own successor. Log the
                    // defect and abandon this enqueue rather than spin
                    // on a corrupt queue.
                    error!(
                        slot = tail.slot(),
                        tail_count = tail.count(),
                        next_count = next.count(),
                        "mailbox tail links to itself; dropping message"
                    );
                    // SAFETY: slot is still private (the link CAS was
                    // never attempted against it).
                    let abandoned = unsafe { (*self.slab.slot(slot).msg.get()).take() };
                    drop(abandoned);
                    self.slab.release(slot);
                    return;
                }
                // Another producer linked a node but has not swung the
                // tail yet; help it forward and retry.
                let swing = Tag::new(next.slot(), self.fresh_count());
                let _ =
                    self.tail
                        .compare_exchange(tail.0, swing.0, Ordering::SeqCst, Ordering::SeqCst);
            }
        }
    }
}

/// The dequeue capability for one mailbox.
///
/// Deliberately not `Clone`, and `recv` takes `&mut self`: the
/// single-consumer invariant is enforced by construction. The registry
/// only ever hands out producers.
pub struct MboxConsumer {
    mbox: Arc<Mbox>,
}

impl MboxConsumer {
    /// Shared core, for binding producers to this mailbox.
    pub fn mbox(&self) -> Arc<Mbox> {
        Arc::clone(&self.mbox)
    }

    /// Dequeue the next message, waiting per `timeout` when the
    /// mailbox is empty. Needs no CAS: only this handle's owner ever
    /// advances the cursor or recycles nodes.
    pub fn recv(&mut self, timeout: Timeout) -> Option<Message> {
        loop {
            let cur = Tag(self.mbox.current.load(Ordering::SeqCst));
            let next = Tag(self.mbox.slab.slot(cur.slot()).next.load(Ordering::SeqCst));

            if next.is_nil() {
                match timeout {
                    Timeout::Immediate => return None,
                    Timeout::Micros(us) => {
                        thread::sleep(Duration::from_micros(us));
                        return None;
                    }
                    Timeout::Block => {
                        std::hint::spin_loop();
                        thread::yield_now();
                    }
                }
                continue;
            }

            if next.slot() == cur.slot() {
                // Cursor claims to succeed itself: a queue invariant
                // violation. Log the defect, step past without
                // recycling the shared slot, and keep the mailbox
                // usable.
                error!(
                    slot = cur.slot(),
                    cur_count = cur.count(),
                    next_count = next.count(),
                    "mailbox cursor links to itself; skipping node recycle"
                );
                // SAFETY: only the consumer reads delivered cells.
                let msg = unsafe { (*self.mbox.slab.slot(next.slot()).msg.get()).take() };
                self.mbox.current.store(next.0, Ordering::SeqCst);
                return msg;
            }

            // SAFETY: the link to `next` was published by a SeqCst CAS
            // after the producer filled the cell, and only the single
            // consumer takes from delivered cells.
            let msg = unsafe { (*self.mbox.slab.slot(next.slot()).msg.get()).take() };
            debug_assert!(msg.is_some(), "linked node without a message");

            // If the shared tail still tags the node we are about to
            // recycle, a producer's best-effort swing is lagging. Help
            // it forward first so a recycled slot can never be reached
            // through a live tail.
            loop {
                let tail = Tag(self.mbox.tail.load(Ordering::SeqCst));
                if tail.slot() != cur.slot() {
                    break;
                }
                let swing = Tag::new(next.slot(), self.mbox.fresh_count());
                if self
                    .mbox
                    .tail
                    .compare_exchange(tail.0, swing.0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }

            // Advance the cursor, then recycle the old sentinel. The
            // node freed is always one step behind the node now
            // exposed, so the consumer never frees what it returns.
            self.mbox.current.store(next.0, Ordering::SeqCst);
            self.mbox.slab.release(cur.slot());
            return msg;
        }
    }
}

impl std::fmt::Debug for Mbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbox")
            .field("tail", &Tag(self.tail.load(Ordering::Relaxed)))
            .field("current", &Tag(self.current.load(Ordering::Relaxed)))
            .finish()
    }
}

impl std::fmt::Debug for MboxConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MboxConsumer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{Payload, Signal, Topic};

    fn signal() -> Message {
        Message::new(Payload::Signal(Signal {
            topic: Topic::TopologyChange,
        }))
    }

    #[test]
    fn tag_packs_and_unpacks() {
        let tag = Tag::new(0xDEAD_BEEF, 0x1234_5678);
        assert_eq!(tag.slot(), 0xDEAD_BEEF);
        assert_eq!(tag.count(), 0x1234_5678);
        assert!(!tag.is_nil());
        assert!(Tag::nil(7).is_nil());
    }

    #[test]
    fn locate_maps_indices_to_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));
    }

    #[test]
    fn slab_recycles_released_slots() {
        let slab = Slab::new();
        let a = slab.alloc();
        slab.release(a);
        let b = slab.alloc();
        // LIFO free stack hands the same slot straight back.
        assert_eq!(a, b);
    }

    #[test]
    fn slab_grows_past_first_segment() {
        let slab = Slab::new();
        let taken: Vec<u32> = (0..SEGMENT_BASE + 1).map(|_| slab.alloc()).collect();
        assert!(taken.iter().any(|&s| s >= SEGMENT_BASE as u32));
        for slot in taken {
            slab.release(slot);
        }
    }

    #[test]
    fn push_then_recv_in_order() {
        let (mut consumer, mbox) = Mbox::new();
        for rowid in 0..10 {
            let mut msg = signal();
            msg.payload = Payload::Subtransaction(types::SubtransactionCmd {
                subtransactionid: 0,
                tableid: 0,
                rowid,
                row: vec![],
            });
            mbox.push(msg);
        }
        for rowid in 0..10 {
            let msg = consumer.recv(Timeout::Immediate).expect("queued");
            match msg.payload {
                Payload::Subtransaction(cmd) => assert_eq!(cmd.rowid, rowid),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert!(consumer.recv(Timeout::Immediate).is_none());
    }

    #[test]
    fn sentinel_is_never_surfaced() {
        let (mut consumer, mbox) = Mbox::new();
        assert!(consumer.recv(Timeout::Immediate).is_none());
        mbox.push(signal());
        assert!(consumer.recv(Timeout::Immediate).is_some());
        assert!(consumer.recv(Timeout::Immediate).is_none());
    }

    #[test]
    fn drop_releases_pending_messages() {
        let (_consumer, mbox) = Mbox::new();
        for _ in 0..100 {
            mbox.push(signal());
        }
        // Dropping both handles tears down slots with queued payloads.
    }
}
