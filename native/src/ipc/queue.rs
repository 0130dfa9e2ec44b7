//! Bounded ring of slots living in one shared memory segment.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────────┐
//! │ low: i32     │ high: i32    │ slot[N] = { kind: i32, id: i32 } │
//! └──────────────┴──────────────┴──────────────────────────────────┘
//! ```
//!
//! `high` is written only by the [`QueueProducer`] (worker), `low` only by the
//! [`QueueConsumer`] (controller). A slot is filled before `high` is published
//! with release ordering, and the consumer loads `high` with acquire ordering,
//! so a visible slot is always fully written. The free-slot semaphore starts at
//! `N-1` and is the only state both sides modify.

use log::{debug, warn};
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{CommError, CommResult};
use crate::shm::{FreeSlotSemaphore, Segment, SegmentId};

/// Segment id stored in slots that carry no payload.
pub const NO_SEGMENT: SegmentId = -1;

/// What a queue slot announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SlotKind {
    /// One-dimensional measurement block in a payload segment.
    Data1D = 1,
    /// Two-dimensional measurement block in a payload segment.
    Data2D = 2,
    /// Marker: a request is waiting on the control channel.
    Request = 3,
}

impl SlotKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Data1D),
            2 => Some(Self::Data2D),
            3 => Some(Self::Request),
            _ => None,
        }
    }

    pub fn is_data(self) -> bool {
        self != Self::Request
    }
}

#[repr(C)]
struct RawSlot {
    kind: AtomicI32,
    segment_id: AtomicI32,
}

#[repr(C)]
struct RawCursors {
    low: AtomicI32,
    high: AtomicI32,
}

const_assert_eq!(std::mem::size_of::<RawSlot>(), 8);
const_assert_eq!(std::mem::size_of::<RawCursors>(), 8);

/// Size of the queue segment for `capacity` slots.
pub const fn queue_segment_size(capacity: usize) -> usize {
    std::mem::size_of::<RawCursors>() + capacity * std::mem::size_of::<RawSlot>()
}

// Typed access to the mapped queue segment.
struct QueueView {
    segment: Segment,
    capacity: usize,
}

impl QueueView {
    fn new(segment: Segment, capacity: usize) -> CommResult<Self> {
        if capacity < 2 || segment.len() < queue_segment_size(capacity) {
            return Err(CommError::Bootstrap(format!(
                "queue segment {} too small for {} slots",
                segment.name(),
                capacity
            )));
        }
        Ok(Self { segment, capacity })
    }

    fn cursors(&self) -> &RawCursors {
        // SAFETY: the segment is at least queue_segment_size(capacity) bytes,
        // page aligned, and all fields are atomics.
        unsafe { &*(self.segment.as_ptr() as *const RawCursors) }
    }

    fn slot(&self, index: usize) -> &RawSlot {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity, so the slot lies inside the segment.
        unsafe {
            let base = self.segment.as_ptr().add(std::mem::size_of::<RawCursors>());
            &*(base as *const RawSlot).add(index)
        }
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.capacity
    }
}

/// Worker side of the queue.
pub struct QueueProducer {
    view: QueueView,
    free: FreeSlotSemaphore,
    poll: Duration,
}

impl QueueProducer {
    /// Attach to a queue created by the controller.
    pub fn open(
        queue_name: &str,
        semaphore_name: &str,
        capacity: usize,
        poll: Duration,
    ) -> CommResult<Self> {
        let view = QueueView::new(Segment::open(queue_name)?, capacity)?;
        let free = FreeSlotSemaphore::open(semaphore_name)?;
        Ok(Self { view, free, poll })
    }

    pub fn capacity(&self) -> usize {
        self.view.capacity
    }

    /// Publish one slot, blocking while the queue is full.
    ///
    /// Fails only with `Cancelled` (termination requested while blocked) or an
    /// OS error from the semaphore.
    pub fn enqueue(
        &self,
        kind: SlotKind,
        segment_id: Option<SegmentId>,
        token: &CancelToken,
    ) -> CommResult<()> {
        self.free.wait(token, self.poll)?;

        let cursors = self.view.cursors();
        let high = cursors.high.load(Ordering::Relaxed);
        let index = match cursor_index(high, self.view.capacity) {
            Some(index) => index,
            None => {
                // Nothing was published, so the permit goes back.
                self.free.post()?;
                return Err(CommError::CorruptQueue {
                    low: cursors.low.load(Ordering::Relaxed),
                    high,
                });
            }
        };

        let slot = self.view.slot(index);
        slot.kind.store(kind as i32, Ordering::Relaxed);
        slot.segment_id
            .store(segment_id.unwrap_or(NO_SEGMENT), Ordering::Relaxed);
        cursors
            .high
            .store(self.view.next(index) as i32, Ordering::Release);
        Ok(())
    }
}

/// Controller side of the queue. Owns the queue segment and the semaphore and
/// removes both when dropped.
pub struct QueueConsumer {
    view: QueueView,
    free: FreeSlotSemaphore,
}

impl QueueConsumer {
    /// Create an empty queue with `capacity` slots (`capacity - 1` usable).
    pub fn create(queue_name: &str, semaphore_name: &str, capacity: usize) -> CommResult<Self> {
        if capacity < 2 {
            return Err(CommError::Bootstrap(format!(
                "queue capacity {} leaves no usable slot",
                capacity
            )));
        }
        let segment = Segment::create(queue_name, queue_segment_size(capacity))?;
        let view = QueueView::new(segment, capacity)?;
        let free = match FreeSlotSemaphore::create(semaphore_name, (capacity - 1) as u32) {
            Ok(free) => free,
            Err(e) => {
                let _ = Segment::unlink(queue_name);
                return Err(e);
            }
        };
        debug!(
            "[QUEUE] Created {} with {} slots",
            view.segment.name(),
            capacity
        );
        Ok(Self { view, free })
    }

    pub fn capacity(&self) -> usize {
        self.view.capacity
    }

    /// True iff at least one published slot is unconsumed.
    pub fn dequeue_ready(&self) -> bool {
        let cursors = self.view.cursors();
        cursors.low.load(Ordering::Relaxed) != cursors.high.load(Ordering::Acquire)
    }

    /// Number of published, unconsumed slots.
    pub fn len(&self) -> CommResult<usize> {
        let (low, high) = self.checked_cursors()?;
        Ok((high + self.view.capacity - low) % self.view.capacity)
    }

    pub fn is_empty(&self) -> bool {
        !self.dequeue_ready()
    }

    /// Kind of the oldest unconsumed slot, without consuming it.
    pub fn peek_kind(&self) -> CommResult<SlotKind> {
        let (low, _) = self.checked_cursors()?;
        let raw = self.view.slot(low).kind.load(Ordering::Relaxed);
        SlotKind::from_raw(raw).ok_or(CommError::InvalidSlotKind(raw))
    }

    /// Payload segment of the oldest unconsumed slot.
    pub fn peek_segment_id(&self) -> CommResult<SegmentId> {
        let (low, _) = self.checked_cursors()?;
        Ok(self.view.slot(low).segment_id.load(Ordering::Relaxed))
    }

    /// Consume the oldest slot and hand its permit back to the producer.
    pub fn advance(&self) -> CommResult<()> {
        let (low, high) = self.checked_cursors()?;
        if low == high {
            return Err(CommError::CorruptQueue {
                low: low as i32,
                high: high as i32,
            });
        }
        self.view
            .cursors()
            .low
            .store(self.view.next(low) as i32, Ordering::Release);
        self.free.post()
    }

    /// Discard every unconsumed slot. Used after the worker was killed; each
    /// discarded slot still returns its permit so the semaphore count and the
    /// queue length keep adding up to `N-1`.
    pub fn reset(&self) -> CommResult<usize> {
        let cursors = self.view.cursors();
        let discarded = match self.checked_cursors() {
            Ok((low, high)) => {
                cursors.low.store(high as i32, Ordering::Release);
                (high + self.view.capacity - low) % self.view.capacity
            }
            Err(e) => {
                warn!("[QUEUE] Resetting corrupt cursors: {}", e);
                cursors.high.store(0, Ordering::Release);
                cursors.low.store(0, Ordering::Release);
                0
            }
        };
        for _ in 0..discarded {
            self.free.post()?;
        }
        if discarded > 0 {
            warn!("[QUEUE] Discarded {} unconsumed slot(s)", discarded);
        }
        Ok(discarded)
    }

    /// Free permits as seen by the semaphore.
    pub fn free_slots(&self) -> CommResult<i32> {
        self.free.value()
    }

    pub fn queue_name(&self) -> &str {
        self.view.segment.name()
    }

    pub fn semaphore_name(&self) -> &str {
        self.free.name()
    }

    fn checked_cursors(&self) -> CommResult<(usize, usize)> {
        let cursors = self.view.cursors();
        let low = cursors.low.load(Ordering::Relaxed);
        let high = cursors.high.load(Ordering::Acquire);
        match (
            cursor_index(low, self.view.capacity),
            cursor_index(high, self.view.capacity),
        ) {
            (Some(l), Some(h)) => Ok((l, h)),
            _ => Err(CommError::CorruptQueue { low, high }),
        }
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        if let Err(e) = Segment::unlink(self.view.segment.name()) {
            warn!("[QUEUE] Failed to unlink {}: {}", self.view.segment.name(), e);
        }
    }
}

fn cursor_index(raw: i32, capacity: usize) -> Option<usize> {
    if raw >= 0 && (raw as usize) < capacity {
        Some(raw as usize)
    } else {
        None
    }
}
