//! SeqLock over a double-buffered region
//!
//! The segment starts with a [`ManagementHeader`] followed by two payload
//! buffers of equal size. Readers copy the front buffer without taking any
//! lock and validate the copy against the sequence word. Writers (already
//! serialized by the semaphore) bump the sequence to odd, rebuild the back
//! buffer from the front one, apply their change, swap the buffers and bump
//! the sequence back to even.
//!
//! ```text
//! ┌──────────────────────┬──────────────────┬──────────────────┐
//! │ ManagementHeader (64)│ buffer 0 (size)  │ buffer 1 (size)  │
//! └──────────────────────┴──────────────────┴──────────────────┘
//! ```

use crate::error::{Result, VenomError};
use crate::shm::ShmSegment;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Bookkeeping shared by every process mapping a double-buffered channel
#[repr(C, align(64))]
pub struct ManagementHeader {
    /// Sequence number: odd = write in progress, even = stable
    sequence: AtomicU64,
    /// Buffer readers copy from
    active_read: AtomicU32,
    /// Buffer the next writer rebuilds
    active_write: AtomicU32,
    /// [`LAYOUT_MAGIC`] once the creator initialized the header
    magic: AtomicU64,
    /// Size of each payload buffer as set up by the creator
    payload_size: AtomicU64,
}

/// Marks a segment laid out as header + two buffers
pub const LAYOUT_MAGIC: u64 = u64::from_le_bytes(*b"VNMDBUF1");

/// Bytes reserved for the header at the start of the segment
pub const HEADER_LEN: usize = std::mem::size_of::<ManagementHeader>();

/// Segment length needed for a double-buffered payload of `size` bytes
pub fn segment_len(size: usize) -> Option<usize> {
    size.checked_mul(2)?.checked_add(HEADER_LEN)
}

/// Double-buffer view over a mapped segment
pub struct DoubleBuffer<'a> {
    shm: &'a ShmSegment,
    size: usize,
}

impl<'a> DoubleBuffer<'a> {
    /// Wrap `shm`, which must hold the header and two `size`-byte buffers
    pub fn new(shm: &'a ShmSegment, size: usize) -> Result<Self> {
        let needed = segment_len(size)
            .ok_or_else(|| VenomError::Config(format!("size {} is too large", size)))?;
        if shm.len() < needed {
            return Err(VenomError::SizeMismatch {
                name: shm.name().to_string(),
                expected: needed,
                actual: shm.len(),
            });
        }
        Ok(Self { shm, size })
    }

    /// Reset the header. Only the creator calls this, before anyone attaches.
    pub fn init(&self) {
        let header = self.header();
        header.sequence.store(0, Ordering::Relaxed);
        header.active_read.store(0, Ordering::Relaxed);
        header.active_write.store(1, Ordering::Relaxed);
        header.payload_size.store(self.size as u64, Ordering::Relaxed);
        header.magic.store(LAYOUT_MAGIC, Ordering::Release);
    }

    /// Check that the creator set the segment up as a double buffer with
    /// payloads of exactly this view's size
    pub fn verify(&self) -> Result<()> {
        let header = self.header();
        if header.magic.load(Ordering::Acquire) != LAYOUT_MAGIC {
            return Err(VenomError::LayoutMismatch {
                name: self.shm.name().to_string(),
                reason: "segment is not an initialized double buffer".into(),
            });
        }
        let recorded = header.payload_size.load(Ordering::Relaxed);
        if recorded != self.size as u64 {
            return Err(VenomError::LayoutMismatch {
                name: self.shm.name().to_string(),
                reason: format!("payload size {} requested, creator used {}", self.size, recorded),
            });
        }
        Ok(())
    }

    /// Current sequence number
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.header().sequence.load(Ordering::Acquire)
    }

    /// Index of the buffer readers currently copy from
    #[inline]
    pub fn front(&self) -> usize {
        (self.header().active_read.load(Ordering::Acquire) & 1) as usize
    }

    /// Publish a change.
    ///
    /// `patch` receives the segment and the offset of the back buffer, which
    /// already holds a copy of the front buffer. If it fails the buffers are
    /// not swapped, so readers keep seeing the previous generation.
    ///
    /// Caller must hold the channel mutex.
    pub fn commit<F>(&self, patch: F) -> Result<()>
    where
        F: FnOnce(&ShmSegment, usize) -> Result<()>,
    {
        let header = self.header();
        let seq = header.sequence.load(Ordering::Relaxed);
        // A writer that died mid-update leaves the word odd
        let begin = if seq & 1 == 0 { seq.wrapping_add(1) } else { seq.wrapping_add(2) };

        // Increment to odd - write in progress
        header.sequence.store(begin, Ordering::Relaxed);
        fence(Ordering::Release);

        let front = header.active_read.load(Ordering::Relaxed) & 1;
        let back = front ^ 1;
        let result = self
            .shm
            .copy_within(self.offset_of(front), self.offset_of(back), self.size)
            .and_then(|()| patch(self.shm, self.offset_of(back)));

        if result.is_ok() {
            header.active_read.store(back, Ordering::Relaxed);
            header.active_write.store(front, Ordering::Relaxed);
        }

        // Increment to even - write complete
        header.sequence.store(begin.wrapping_add(1), Ordering::Release);

        result
    }

    /// One optimistic read attempt into `dst` (exactly `size` bytes).
    ///
    /// Returns `Ok(false)` if a writer was active or finished during the copy;
    /// the content of `dst` must then be discarded.
    #[inline]
    pub fn try_read(&self, dst: &mut [u8]) -> Result<bool> {
        let header = self.header();

        let seq1 = header.sequence.load(Ordering::Acquire);
        if seq1 & 1 == 1 {
            return Ok(false);
        }

        let front = header.active_read.load(Ordering::Relaxed) & 1;
        self.shm.read_into(self.offset_of(front), &mut dst[..self.size])?;

        fence(Ordering::Acquire);

        let seq2 = header.sequence.load(Ordering::Relaxed);
        Ok(seq1 == seq2)
    }

    /// Overwrite the start of the front buffer without touching the
    /// sequence word. Not synchronized with readers or writers.
    pub fn replace_front(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.size {
            return Err(VenomError::TooLarge {
                max: self.size,
                got: data.len(),
            });
        }
        let front = self.header().active_read.load(Ordering::Relaxed) & 1;
        self.shm.write_from(self.offset_of(front), data)
    }

    #[inline(always)]
    fn offset_of(&self, buffer: u32) -> usize {
        HEADER_LEN + buffer as usize * self.size
    }

    #[inline(always)]
    fn header(&self) -> &ManagementHeader {
        header_of(self.shm)
    }
}

/// Payload size recorded in an initialized double-buffer header at the start
/// of `shm`, if the recorded layout accounts for the whole segment
pub fn recorded_payload_size(shm: &ShmSegment) -> Option<usize> {
    if shm.len() < HEADER_LEN {
        return None;
    }
    let header = header_of(shm);
    if header.magic.load(Ordering::Acquire) != LAYOUT_MAGIC {
        return None;
    }
    let size = usize::try_from(header.payload_size.load(Ordering::Relaxed)).ok()?;
    (segment_len(size) == Some(shm.len())).then_some(size)
}

#[inline(always)]
fn header_of(shm: &ShmSegment) -> &ManagementHeader {
    // SAFETY: callers checked the segment holds a header; the mapping is
    // page aligned and the header is only accessed through atomics
    unsafe { &*(shm.as_ptr() as *const ManagementHeader) }
}
