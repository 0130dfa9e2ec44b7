// Shared memory building blocks: named segments, the payload pool and the
// free-slot semaphore.

pub mod allocator;
pub mod segment;
pub mod semaphore;

pub use allocator::{
    process_alive, PayloadSegment, SegmentAllocator, SegmentId, SegmentTag, ShmAllocator,
    SEGMENT_MAGIC,
};
pub use segment::Segment;
pub use semaphore::FreeSlotSemaphore;
