// Pool of payload segments addressed by small integer ids.

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use static_assertions::const_assert_eq;
use std::ptr;
use std::time::Duration;

use super::segment::Segment;
use crate::cancel::CancelToken;
use crate::error::{CommError, CommResult};

pub type SegmentId = i32;

/// Magic marker identifying a segment written by this pool: `"LABSEG01"`.
pub const SEGMENT_MAGIC: u64 = u64::from_le_bytes(*b"LABSEG01");

/// Header at the start of every payload segment.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SegmentTag {
    pub magic: u64,
    /// Pid of the process currently responsible for releasing the segment.
    pub owner_pid: i32,
    pub _reserved: u32,
    pub payload_len: u64,
}

const_assert_eq!(std::mem::size_of::<SegmentTag>(), 24);

pub const TAG_SIZE: usize = std::mem::size_of::<SegmentTag>();

/// Contract of the segment pool used by both processes.
pub trait SegmentAllocator {
    /// Reserve a segment able to hold `size` payload bytes.
    fn acquire(&mut self, size: usize) -> CommResult<SegmentId>;
    /// Map a reserved segment into this process.
    fn attach(&self, id: SegmentId) -> CommResult<PayloadSegment>;
    /// Return a segment to the pool.
    fn release(&mut self, id: SegmentId) -> CommResult<()>;
}

/// A mapped payload segment. Dropping it detaches the mapping.
pub struct PayloadSegment {
    id: SegmentId,
    segment: Segment,
}

impl PayloadSegment {
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Bytes available for payload after the tag.
    pub fn capacity(&self) -> usize {
        self.segment.len().saturating_sub(TAG_SIZE)
    }

    pub fn tag(&self) -> SegmentTag {
        // SAFETY: every pool segment is at least TAG_SIZE bytes and mmap
        // returns page-aligned memory.
        unsafe { ptr::read_volatile(self.segment.as_ptr() as *const SegmentTag) }
    }

    fn write_tag(&self, tag: SegmentTag) {
        // SAFETY: see `tag`.
        unsafe { ptr::write_volatile(self.segment.as_ptr() as *mut SegmentTag, tag) }
    }

    /// Take over responsibility for releasing this segment.
    pub fn claim(&self) {
        let mut tag = self.tag();
        tag.owner_pid = std::process::id() as i32;
        self.write_tag(tag);
    }

    /// Copy `data` into the segment and record its length.
    pub fn write_payload(&mut self, data: &[u8]) -> CommResult<()> {
        if data.len() > self.capacity() {
            return Err(CommError::SegmentTooSmall {
                id: self.id,
                needed: data.len(),
                capacity: self.capacity(),
            });
        }
        // SAFETY: bounds checked above; the region past the tag is ours.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.segment.as_ptr().add(TAG_SIZE),
                data.len(),
            );
        }
        let mut tag = self.tag();
        tag.payload_len = data.len() as u64;
        self.write_tag(tag);
        Ok(())
    }

    /// Validated view of the payload written by the producer.
    pub fn payload(&self) -> CommResult<&[u8]> {
        let tag = self.tag();
        if tag.magic != SEGMENT_MAGIC {
            return Err(CommError::Malformed(format!(
                "segment {} carries no pool tag",
                self.id
            )));
        }
        let len = tag.payload_len as usize;
        if len > self.capacity() {
            return Err(CommError::Malformed(format!(
                "segment {} claims {} payload bytes but holds {}",
                self.id,
                len,
                self.capacity()
            )));
        }
        // SAFETY: bounds checked above; the mapping lives as long as self.
        Ok(unsafe { std::slice::from_raw_parts(self.segment.as_ptr().add(TAG_SIZE), len) })
    }

    pub fn detach(self) {
        debug!("[SHM] Detached segment {}", self.id);
    }
}

/// Segment pool backed by POSIX named shared memory.
///
/// Ids range over `0..max_segments` and a segment is live while its name
/// exists, so both processes agree on occupancy without extra bookkeeping.
pub struct ShmAllocator {
    prefix: String,
    max_segments: usize,
    max_payload_size: usize,
    next_hint: usize,
}

impl ShmAllocator {
    pub fn new(prefix: &str, max_segments: usize, max_payload_size: usize) -> Self {
        Self {
            prefix: prefix.to_string(),
            max_segments,
            max_payload_size,
            next_hint: 0,
        }
    }

    pub fn segment_name(&self, id: SegmentId) -> String {
        format!("/{}-seg-{}", self.prefix, id)
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    fn check_id(&self, id: SegmentId) -> CommResult<()> {
        if id < 0 || id as usize >= self.max_segments {
            return Err(CommError::Malformed(format!(
                "segment id {} outside pool of {}",
                id, self.max_segments
            )));
        }
        Ok(())
    }

    /// Number of segment names currently present in the pool.
    pub fn live_count(&self) -> usize {
        (0..self.max_segments as SegmentId)
            .filter(|&id| Segment::open(&self.segment_name(id)).is_ok())
            .count()
    }

    /// `acquire` with a bounded, cancellable sleep-and-retry on exhaustion.
    pub fn acquire_with_backoff(
        &mut self,
        size: usize,
        retries: u32,
        backoff: Duration,
        token: &CancelToken,
        poll: Duration,
    ) -> CommResult<SegmentId> {
        let mut attempt = 0;
        loop {
            match self.acquire(size) {
                Err(CommError::Exhausted(live)) if attempt < retries => {
                    attempt += 1;
                    if attempt == 1 {
                        debug!("[SHM] Pool exhausted ({} live), backing off", live);
                    }
                    token.sleep(backoff, poll)?;
                }
                other => return other,
            }
        }
    }

    /// Remove every pool segment whose owner is gone or whose tag is missing.
    /// Returns the number of segments reclaimed.
    pub fn sweep_orphans(&mut self) -> usize {
        let mut reclaimed = 0;
        for id in 0..self.max_segments as SegmentId {
            let name = self.segment_name(id);
            let segment = match Segment::open(&name) {
                Ok(segment) => segment,
                Err(CommError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("[SHM] Cannot inspect {}: {}", name, e);
                    continue;
                }
            };
            let orphaned = if segment.len() < TAG_SIZE {
                true
            } else {
                let view = PayloadSegment { id, segment };
                let tag = view.tag();
                tag.magic != SEGMENT_MAGIC || !process_alive(tag.owner_pid)
            };
            if orphaned {
                match Segment::unlink(&name) {
                    Ok(()) | Err(CommError::NotFound(_)) => reclaimed += 1,
                    Err(e) => warn!("[SHM] Failed to reclaim {}: {}", name, e),
                }
            }
        }
        if reclaimed > 0 {
            info!("[SHM] Reclaimed {} orphaned segment(s)", reclaimed);
        }
        reclaimed
    }
}

impl SegmentAllocator for ShmAllocator {
    fn acquire(&mut self, size: usize) -> CommResult<SegmentId> {
        if size > self.max_payload_size {
            return Err(CommError::SegmentTooSmall {
                id: -1,
                needed: size,
                capacity: self.max_payload_size,
            });
        }
        for offset in 0..self.max_segments {
            let id = ((self.next_hint + offset) % self.max_segments) as SegmentId;
            let name = self.segment_name(id);
            match Segment::create(&name, TAG_SIZE + size.max(1)) {
                Ok(segment) => {
                    let view = PayloadSegment { id, segment };
                    view.write_tag(SegmentTag {
                        magic: SEGMENT_MAGIC,
                        owner_pid: std::process::id() as i32,
                        _reserved: 0,
                        payload_len: 0,
                    });
                    self.next_hint = (id as usize + 1) % self.max_segments;
                    return Ok(id);
                }
                Err(CommError::Os(Errno::EEXIST)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CommError::Exhausted(self.max_segments))
    }

    fn attach(&self, id: SegmentId) -> CommResult<PayloadSegment> {
        self.check_id(id)?;
        let segment = Segment::open(&self.segment_name(id))?;
        if segment.len() < TAG_SIZE {
            return Err(CommError::Malformed(format!("segment {} is truncated", id)));
        }
        Ok(PayloadSegment { id, segment })
    }

    fn release(&mut self, id: SegmentId) -> CommResult<()> {
        self.check_id(id)?;
        Segment::unlink(&self.segment_name(id))
    }
}

/// Liveness probe via signal 0. EPERM still means the process exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> ShmAllocator {
        let prefix = format!("labctl-test-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        ShmAllocator::new(&prefix, max, 4096)
    }

    fn drain(pool: &mut ShmAllocator) {
        for id in 0..pool.max_segments() as SegmentId {
            let _ = pool.release(id);
        }
    }

    #[test]
    fn payload_survives_handoff() {
        let mut pool = pool(2);
        let id = pool.acquire(16).unwrap();

        let mut producer_view = pool.attach(id).unwrap();
        producer_view.write_payload(b"sample").unwrap();
        producer_view.detach();

        let consumer_view = pool.attach(id).unwrap();
        consumer_view.claim();
        assert_eq!(consumer_view.payload().unwrap(), b"sample");
        assert_eq!(consumer_view.tag().owner_pid, std::process::id() as i32);
        consumer_view.detach();

        pool.release(id).unwrap();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pool = pool(2);
        pool.acquire(8).unwrap();
        pool.acquire(8).unwrap();
        assert!(matches!(pool.acquire(8), Err(CommError::Exhausted(2))));
        drain(&mut pool);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut pool = pool(1);
        let id = pool.acquire(4).unwrap();
        let mut view = pool.attach(id).unwrap();
        assert!(matches!(
            view.write_payload(&[0u8; 64]),
            Err(CommError::SegmentTooSmall { .. })
        ));
        drop(view);
        drain(&mut pool);
    }

    #[test]
    fn attach_rejects_foreign_ids() {
        let pool = pool(2);
        assert!(matches!(pool.attach(7), Err(CommError::Malformed(_))));
        assert!(matches!(pool.attach(-1), Err(CommError::Malformed(_))));
    }

    #[test]
    fn backoff_gives_up_after_retries() {
        let mut pool = pool(1);
        pool.acquire(8).unwrap();
        let token = CancelToken::new();
        let result = pool.acquire_with_backoff(
            8,
            3,
            Duration::from_millis(1),
            &token,
            Duration::from_millis(1),
        );
        assert!(matches!(result, Err(CommError::Exhausted(1))));
        drain(&mut pool);
    }

    #[test]
    fn sweep_reclaims_segments_of_dead_owners() {
        let mut pool = pool(3);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as i32;
        child.wait().unwrap();

        let orphan = pool.acquire(8).unwrap();
        let view = pool.attach(orphan).unwrap();
        let mut tag = view.tag();
        tag.owner_pid = dead_pid;
        view.write_tag(tag);
        drop(view);

        let kept = pool.acquire(8).unwrap();

        assert_eq!(pool.sweep_orphans(), 1);
        assert!(pool.attach(orphan).is_err());
        assert!(pool.attach(kept).is_ok());
        drain(&mut pool);
    }

    #[test]
    fn repeated_orphans_never_exhaust_the_pool() {
        let mut pool = pool(2);
        for _ in 0..5 {
            let mut child = std::process::Command::new("true").spawn().unwrap();
            let dead_pid = child.id() as i32;
            child.wait().unwrap();

            pool.sweep_orphans();
            for _ in 0..2 {
                let id = pool.acquire(8).unwrap();
                let view = pool.attach(id).unwrap();
                let mut tag = view.tag();
                tag.owner_pid = dead_pid;
                view.write_tag(tag);
            }
        }
        pool.sweep_orphans();
        assert_eq!(pool.live_count(), 0);
    }
}
