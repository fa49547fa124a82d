//! Low-level POSIX shared memory operations
//!
//! [`ShmSegment`] owns the mapping. Raw pointers never leave this module
//! except through the crate-private [`ShmSegment::as_ptr`]; everything public
//! is offset-validated and copies in or out.

use crate::error::{Result, VenomError};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use tracing::{debug, warn};

const SHM_PREFIX: &str = "/";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Handle to a mapped shared memory segment
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    len: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the mapping is process-shared memory; all access goes through
// bounds-checked copies, and cross-process ordering is provided by the
// semaphore or the seqlock header
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create the segment `name`, size it to `len` bytes and zero it. The
    /// returned handle unlinks the segment on drop.
    ///
    /// An existing segment of the same name is taken over: resized, zeroed
    /// and later unlinked by this handle. Nothing checks whether its previous
    /// creator is still alive, so a live channel that happens to use the same
    /// segment name under a different semaphore key loses its contents.
    /// Callers own the naming scheme and must keep segment names unique per
    /// semaphore key.
    pub fn create(name: &str, len: usize, permissions: u32) -> Result<Self> {
        let c_name = shm_name(name)?;
        let mode = Mode::from_bits_truncate(permissions & 0o777);

        // Try to create exclusively first, fall back to open if a stale
        // segment from a crashed owner is still around
        let fd = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            mode,
        ) {
            Ok(fd) => fd,
            Err(_) => {
                warn!(name, "shared memory already exists, reusing it");
                shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
                    VenomError::ShmCreate {
                        name: name.to_string(),
                        source: e.into(),
                    }
                })?
            }
        };

        ftruncate(&fd, len as u64).map_err(|e| VenomError::Truncate(e.into()))?;

        let addr = map(&fd, len)?;

        // SAFETY: freshly mapped, len bytes writable
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, len);
        }

        debug!(name, len, "created shared memory");

        Ok(Self {
            fd,
            addr,
            len,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open an existing segment of exactly `len` bytes and map it
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let c_name = shm_name(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            VenomError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let stat = fstat(&fd).map_err(|e| VenomError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let actual = usize::try_from(stat.st_size).unwrap_or(0);
        // Must match the creator's layout exactly
        if actual != len {
            return Err(VenomError::SizeMismatch {
                name: name.to_string(),
                expected: len,
                actual,
            });
        }

        let addr = map(&fd, len)?;

        debug!(name, len, "opened shared memory");

        Ok(Self {
            fd,
            addr,
            len,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the segment
    #[inline]
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        // SAFETY: range checked above; dst is private memory
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the segment at `offset`
    #[inline]
    pub fn write_from(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        // SAFETY: range checked above; src is private memory
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.addr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Copy `count` bytes from `src` to `dst` inside the segment
    #[inline]
    pub fn copy_within(&self, src: usize, dst: usize, count: usize) -> Result<()> {
        self.check(src, count)?;
        self.check(dst, count)?;
        // SAFETY: both ranges checked; copy handles overlap
        unsafe {
            let base = self.addr.as_ptr();
            std::ptr::copy(base.add(src), base.add(dst), count);
        }
        Ok(())
    }

    #[inline]
    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        self.check(offset, 1)?;
        // SAFETY: offset checked above
        Ok(unsafe { std::ptr::read_volatile(self.addr.as_ptr().add(offset)) })
    }

    #[inline]
    pub fn write_byte(&self, offset: usize, value: u8) -> Result<()> {
        self.check(offset, 1)?;
        // SAFETY: offset checked above
        unsafe { std::ptr::write_volatile(self.addr.as_ptr().add(offset), value) };
        Ok(())
    }

    /// Base address of the mapping
    #[inline(always)]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Mapped length in bytes
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name of the segment without the leading slash
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether dropping this handle unlinks the segment
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    #[inline]
    fn check(&self, offset: usize, length: usize) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(VenomError::RangeExceeded {
                offset,
                length,
                size: self.len,
            }),
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: addr/len came from a successful mmap
        unsafe {
            if let Err(e) = munmap(self.addr.as_ptr().cast(), self.len) {
                warn!(name = %self.name, error = %e, "munmap failed");
            }
        }

        if self.is_owner {
            if let Ok(c_name) = shm_name(&self.name) {
                match shm_unlink(c_name.as_c_str()) {
                    Ok(()) => debug!(name = %self.name, "unlinked shared memory"),
                    Err(e) => warn!(name = %self.name, error = %e, "shm_unlink failed"),
                }
            }
        }
    }
}

fn shm_name(name: &str) -> Result<CString> {
    crate::key::validate_name(name)?;
    if name.len() > MAX_NAME_LEN {
        return Err(VenomError::Config(format!(
            "Namespace too long: max {} chars, got {}",
            MAX_NAME_LEN,
            name.len()
        )));
    }
    CString::new(format!("{}{}", SHM_PREFIX, name))
        .map_err(|_| VenomError::Config(format!("name '{}' contains NUL", name.escape_debug())))
}

fn map(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    if len == 0 {
        return Err(VenomError::Config("cannot map an empty segment".into()));
    }
    // SAFETY: fresh shared mapping of a file we hold open
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| VenomError::Mmap(e.into()))?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| VenomError::Mmap(std::io::Error::from_raw_os_error(libc::EFAULT)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "venom_shm_{}_{}_{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_and_open() {
        let name = unique("create");
        let len = 4096;

        let shm1 = ShmSegment::create(&name, len, 0o600).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.len(), len);
        assert_eq!(shm1.read_byte(17).unwrap(), 0);

        shm1.write_from(10, b"venom").unwrap();

        // Open from another "process"
        let shm2 = ShmSegment::open(&name, len).unwrap();
        assert!(!shm2.is_owner());

        let mut buf = [0u8; 5];
        shm2.read_into(10, &mut buf).unwrap();
        assert_eq!(&buf, b"venom");

        // Dropping the opener keeps the segment alive
        drop(shm2);
        assert!(ShmSegment::open(&name, len).is_ok());

        drop(shm1);
        assert!(matches!(
            ShmSegment::open(&name, len),
            Err(VenomError::ShmOpen { .. })
        ));
    }

    #[test]
    fn test_bounds_checked() {
        let name = unique("bounds");
        let shm = ShmSegment::create(&name, 16, 0o600).unwrap();

        assert!(shm.write_from(15, &[1]).is_ok());
        assert!(matches!(
            shm.write_from(15, &[1, 2]),
            Err(VenomError::RangeExceeded { offset: 15, length: 2, size: 16 })
        ));
        assert!(shm.read_byte(16).is_err());
        assert!(shm.write_byte(usize::MAX, 1).is_err());

        let mut big = [0u8; 17];
        assert!(shm.read_into(0, &mut big).is_err());
        assert!(shm.copy_within(0, 8, 9).is_err());

        shm.write_from(0, &[1, 2, 3, 4]).unwrap();
        shm.copy_within(0, 8, 4).unwrap();
        let mut out = [0u8; 4];
        shm.read_into(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_open_smaller_segment_fails() {
        let name = unique("small");
        let _owner = ShmSegment::create(&name, 64, 0o600).unwrap();
        assert!(matches!(
            ShmSegment::open(&name, 128),
            Err(VenomError::SizeMismatch { expected: 128, actual: 64, .. })
        ));
    }

    #[test]
    fn test_open_larger_segment_fails() {
        let name = unique("large");
        let _owner = ShmSegment::create(&name, 128, 0o600).unwrap();
        assert!(matches!(
            ShmSegment::open(&name, 64),
            Err(VenomError::SizeMismatch { expected: 64, actual: 128, .. })
        ));
    }

    #[test]
    fn test_create_takes_over_existing_segment() {
        let name = unique("takeover");
        let first = ShmSegment::create(&name, 32, 0o600).unwrap();
        first.write_from(0, b"stale").unwrap();

        let second = ShmSegment::create(&name, 16, 0o600).unwrap();
        assert!(second.is_owner());
        assert_eq!(second.len(), 16);
        let mut buf = [0xFFu8; 5];
        second.read_into(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 5]);

        // Either owner unlinks the shared name
        drop(second);
        assert!(matches!(
            ShmSegment::open(&name, 16),
            Err(VenomError::ShmOpen { .. })
        ));
        drop(first);
    }

    #[test]
    fn test_bad_names() {
        assert!(matches!(ShmSegment::create("", 8, 0o600), Err(VenomError::Config(_))));
        assert!(matches!(ShmSegment::create("a/b", 8, 0o600), Err(VenomError::Config(_))));
        let long = "x".repeat(300);
        assert!(matches!(ShmSegment::open(&long, 8), Err(VenomError::Config(_))));
    }
}
