//! High-level Channel API
//!
//! A [`Channel`] is one shared memory region plus the System V semaphore
//! guarding it. In [`BufferMode::Mutex`] every access runs under the
//! semaphore. In [`BufferMode::DoubleBuffer`] writers still take the
//! semaphore but readers go through the seqlock and never block.
//!
//! The process that opens the semaphore with [`SemMode::CreateNew`] owns the
//! channel: it creates the segment and removes the segment, the semaphore set
//! and the key file again on close. Everybody else only unmaps.
//!
//! `lock()` blocks without timeout. A peer that dies while holding the
//! semaphore leaves every other process hanging; nothing here detects or
//! repairs that.

use crate::config::ChannelConfig;
use crate::error::{Result, VenomError};
use crate::retry::{Attempt, RetryPolicy};
use crate::semaphore::{SemMode, SemaphoreHandle};
use crate::seqlock::{self, DoubleBuffer};
use crate::shm::ShmSegment;
use tracing::debug;

/// Synchronization discipline of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Single buffer, every read and write under the semaphore
    Mutex,
    /// Two buffers behind a seqlock; lock-free reads
    DoubleBuffer,
}

impl BufferMode {
    pub fn from_double_buffer(double_buffer: bool) -> Self {
        if double_buffer {
            BufferMode::DoubleBuffer
        } else {
            BufferMode::Mutex
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Patch<'d> {
    Range { offset: usize, data: &'d [u8] },
    Mask { offset: usize, mask: u8, value: bool },
}

impl Patch<'_> {
    fn apply(&self, shm: &ShmSegment, base: usize) -> Result<()> {
        match *self {
            Patch::Range { offset, data } => shm.write_from(base + offset, data),
            Patch::Mask {
                offset,
                mask,
                value,
            } => {
                let old = shm.read_byte(base + offset)?;
                shm.write_byte(base + offset, apply_mask(old, mask, value))
            }
        }
    }
}

/// `old | mask` when `value` is set, `old & !mask` otherwise
#[inline]
pub fn apply_mask(old: u8, mask: u8, value: bool) -> u8 {
    if value {
        old | mask
    } else {
        old & !mask
    }
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Read,
    Write,
}

// Field order is drop order: unmap before the semaphore goes away
struct Inner {
    shm: ShmSegment,
    sem: SemaphoreHandle,
}

/// One shared memory region plus its semaphore
pub struct Channel {
    name: String,
    size: usize,
    mode: BufferMode,
    owner: bool,
    retry: RetryPolicy,
    inner: Option<Inner>,
}

impl Channel {
    /// Open a channel with [`ChannelConfig::from_env`], so `VENOM_KEY_DIR`
    /// and `VENOM_MAX_RETRIES` apply. Malformed values are a
    /// [`VenomError::Config`].
    pub fn open(
        name: &str,
        size: usize,
        double_buffer: bool,
        sem_key_name: &str,
        sem_mode: SemMode,
    ) -> Result<Self> {
        Self::open_with_lookup(name, size, double_buffer, sem_key_name, sem_mode, |var| {
            std::env::var(var).ok()
        })
    }

    pub(crate) fn open_with_lookup<F>(
        name: &str,
        size: usize,
        double_buffer: bool,
        sem_key_name: &str,
        sem_mode: SemMode,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = ChannelConfig::from_lookup(lookup)?;
        Self::open_with_config(name, size, double_buffer, sem_key_name, sem_mode, &config)
    }

    /// Open a channel.
    ///
    /// The semaphore is opened first. If it was created here, this instance
    /// owns the channel and creates the segment; otherwise the segment must
    /// already exist.
    pub fn open_with_config(
        name: &str,
        size: usize,
        double_buffer: bool,
        sem_key_name: &str,
        sem_mode: SemMode,
        config: &ChannelConfig,
    ) -> Result<Self> {
        if size == 0 {
            return Err(VenomError::Config(
                "The buffer size must be greater than zero".into(),
            ));
        }
        crate::key::validate_name(name)?;
        config.validate()?;

        let mode = BufferMode::from_double_buffer(double_buffer);
        let segment_len = match mode {
            BufferMode::Mutex => size,
            BufferMode::DoubleBuffer => seqlock::segment_len(size)
                .ok_or_else(|| VenomError::Config(format!("size {} is too large", size)))?,
        };

        let sem = SemaphoreHandle::open(sem_key_name, sem_mode, config)?;
        let owner = sem.is_owner();

        let shm = if owner {
            ShmSegment::create(name, segment_len, config.permissions)?
        } else {
            ShmSegment::open(name, segment_len)?
        };

        match (mode, owner) {
            (BufferMode::DoubleBuffer, true) => DoubleBuffer::new(&shm, size)?.init(),
            (BufferMode::DoubleBuffer, false) => DoubleBuffer::new(&shm, size)?.verify()?,
            (BufferMode::Mutex, true) => {}
            (BufferMode::Mutex, false) => {
                // Writing at offset 0 would clobber the seqlock header
                if let Some(recorded) = seqlock::recorded_payload_size(&shm) {
                    return Err(VenomError::LayoutMismatch {
                        name: name.to_string(),
                        reason: format!(
                            "opened as a single buffer, segment is a double buffer of {} bytes",
                            recorded
                        ),
                    });
                }
            }
        }

        debug!(name, size, ?mode, owner, sem_id = ?sem.id(), "channel open");

        Ok(Self {
            name: name.to_string(),
            size,
            mode,
            owner,
            retry: config.retry,
            inner: Some(Inner { shm, sem }),
        })
    }

    /// Copy `data` into `[offset, offset + length)`.
    ///
    /// Fails before touching memory if the range leaves the region or
    /// `data.len() != length`.
    pub fn write_range(&self, offset: usize, length: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, length)?;
        if data.len() != length {
            return Err(VenomError::LengthMismatch {
                expected: length,
                got: data.len(),
            });
        }
        self.write_patch(Patch::Range { offset, data })
    }

    /// Set (`value = true`) or clear the bits of `mask` in the byte at `offset`.
    ///
    /// The read-modify-write always happens under the semaphore, in both
    /// modes.
    pub fn write_masked_byte(&self, offset: usize, mask: u8, value: bool) -> Result<()> {
        self.check_range(offset, 1)?;
        self.write_patch(Patch::Mask {
            offset,
            mask,
            value,
        })
    }

    /// Independent copy of the whole region
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        let mut buf = vec![0u8; self.size];

        match self.mode {
            BufferMode::Mutex => {
                self.locked(inner, OpKind::Read, |shm| shm.read_into(0, &mut buf))?;
            }
            BufferMode::DoubleBuffer => {
                let db = DoubleBuffer::new(&inner.shm, self.size)?;
                let outcome = self.retry.run("read_all", |_| match db.try_read(&mut buf) {
                    Ok(true) => Attempt::Done(Ok(())),
                    Ok(false) => Attempt::Retry,
                    Err(e) => Attempt::Done(Err(e)),
                });
                match outcome {
                    Some(result) => result?,
                    None => {
                        return Err(VenomError::ReadFailed {
                            attempts: self.retry.max_attempts(),
                            reason: "sequence changed during every attempt".into(),
                        })
                    }
                }
            }
        }

        Ok(buf)
    }

    /// Overwrite the start of the region with `data` without any locking.
    ///
    /// Meant for a single writer populating the region before anybody else
    /// uses it. Concurrent readers may see torn data and concurrent writers
    /// may be lost; callers serialize externally.
    pub fn replace_all(&self, data: &[u8]) -> Result<()> {
        let inner = self.inner()?;
        if data.len() > self.size {
            return Err(VenomError::TooLarge {
                max: self.size,
                got: data.len(),
            });
        }
        match self.mode {
            BufferMode::Mutex => inner.shm.write_from(0, data),
            BufferMode::DoubleBuffer => DoubleBuffer::new(&inner.shm, self.size)?.replace_front(data),
        }
    }

    /// Unmap the region. The owner also removes the segment, the semaphore
    /// set and the key file. Calling it again does nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(inner) = self.inner.take() {
            debug!(name = %self.name, owner = self.owner, "closing channel");
            drop(inner);
        }
        Ok(())
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Name of the shared memory segment
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Whether closing this channel tears down the OS resources
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// The semaphore handle, until the channel is closed
    pub fn semaphore(&self) -> Option<&SemaphoreHandle> {
        self.inner.as_ref().map(|inner| &inner.sem)
    }

    /// Seqlock sequence number (double-buffered channels only)
    pub fn sequence(&self) -> Option<u64> {
        let inner = self.inner.as_ref()?;
        match self.mode {
            BufferMode::Mutex => None,
            BufferMode::DoubleBuffer => DoubleBuffer::new(&inner.shm, self.size)
                .ok()
                .map(|db| db.sequence()),
        }
    }

    fn write_patch(&self, patch: Patch<'_>) -> Result<()> {
        let inner = self.inner()?;
        match self.mode {
            BufferMode::Mutex => self.locked(inner, OpKind::Write, |shm| patch.apply(shm, 0)),
            BufferMode::DoubleBuffer => self.locked(inner, OpKind::Write, |shm| {
                DoubleBuffer::new(shm, self.size)?.commit(|shm, base| patch.apply(shm, base))
            }),
        }
    }

    /// Run `op` between lock and unlock, retrying the whole sequence when
    /// either step fails
    fn locked<T, F>(&self, inner: &Inner, kind: OpKind, mut op: F) -> Result<T>
    where
        F: FnMut(&ShmSegment) -> Result<T>,
    {
        let what = match kind {
            OpKind::Read => "locked_read",
            OpKind::Write => "locked_write",
        };

        let outcome = self.retry.run(what, |_| {
            if !inner.sem.lock() {
                return Attempt::Retry;
            }
            let result = op(&inner.shm);
            if !inner.sem.unlock() {
                return Attempt::Retry;
            }
            Attempt::Done(result)
        });

        match outcome {
            Some(result) => result,
            None => {
                let attempts = self.retry.max_attempts();
                let reason = inner
                    .sem
                    .last_error()
                    .unwrap_or_else(|| "semaphore operation failed".into());
                Err(match kind {
                    OpKind::Read => VenomError::ReadFailed { attempts, reason },
                    OpKind::Write => VenomError::WriteFailed { attempts, reason },
                })
            }
        }
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VenomError::RangeExceeded {
                offset,
                length,
                size: self.size,
            }),
        }
    }

    fn inner(&self) -> Result<&Inner> {
        self.inner
            .as_ref()
            .ok_or_else(|| VenomError::Closed(self.name.clone()))
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique(tag: &str) -> String {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        format!(
            "venom_chan_{}_{}_{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_apply_mask() {
        assert_eq!(apply_mask(0b1000_0001, 0b0000_0110, true), 0b1000_0111);
        assert_eq!(apply_mask(0b1111_1111, 0b0000_0110, false), 0b1111_1001);
        assert_eq!(apply_mask(0, 0, true), 0);
    }

    #[test]
    fn test_zero_size_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig::default().key_dir(dir.path());
        let name = unique("zero");
        let err = Channel::open_with_config(&name, 0, false, &name, SemMode::CreateNew, &config)
            .err()
            .unwrap();
        assert!(matches!(err, VenomError::Config(_)));
    }

    #[test]
    fn test_mutex_roundtrip_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig::default().key_dir(dir.path());
        let name = unique("mutex");

        let mut channel =
            Channel::open_with_config(&name, 16, false, &name, SemMode::CreateNew, &config).unwrap();
        assert!(channel.is_owner());
        assert_eq!(channel.mode(), BufferMode::Mutex);
        assert_eq!(channel.sequence(), None);

        channel.write_range(4, 3, b"abc").unwrap();
        channel.write_masked_byte(0, 0b0000_0110, true).unwrap();

        let data = channel.read_all().unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(&data[4..7], b"abc");
        assert_eq!(data[0], 0b0000_0110);
        assert_eq!(channel.semaphore().unwrap().value().unwrap(), 1);

        channel.close().unwrap();
        channel.close().unwrap();
        assert!(channel.is_closed());
        assert!(matches!(channel.read_all(), Err(VenomError::Closed(_))));
    }

    #[test]
    fn test_double_buffer_sequence_advances() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig::default().key_dir(dir.path());
        let name = unique("db");

        let channel =
            Channel::open_with_config(&name, 8, true, &name, SemMode::CreateNew, &config).unwrap();
        assert_eq!(channel.sequence(), Some(0));

        channel.write_range(0, 2, &[1, 2]).unwrap();
        assert_eq!(channel.sequence(), Some(2));

        channel.write_masked_byte(7, 0x80, true).unwrap();
        assert_eq!(channel.sequence(), Some(4));

        assert_eq!(channel.read_all().unwrap(), vec![1, 2, 0, 0, 0, 0, 0, 0x80]);
    }

    #[test]
    fn test_open_applies_environment_overrides() {
        use crate::config::{ENV_KEY_DIR, ENV_MAX_RETRIES};

        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("jupiter");
        let key_dir_str = key_dir.to_str().unwrap().to_string();
        let name = unique("env");

        let channel = Channel::open_with_lookup(&name, 8, false, &name, SemMode::CreateNew, |var| {
            match var {
                ENV_KEY_DIR => Some(key_dir_str.clone()),
                ENV_MAX_RETRIES => Some("4".to_string()),
                _ => None,
            }
        })
        .unwrap();

        let key_path = channel.semaphore().unwrap().key().unwrap().path().to_path_buf();
        assert_eq!(key_path, key_dir.join(&name));
        assert!(key_path.exists());
        assert_eq!(channel.retry.max_attempts(), 5);

        drop(channel);
        assert!(!key_path.exists());
    }

    #[test]
    fn test_open_rejects_malformed_environment() {
        let name = unique("env_bad");
        let err = Channel::open_with_lookup(&name, 8, false, &name, SemMode::CreateNew, |var| {
            (var == crate::config::ENV_MAX_RETRIES).then(|| "lots".to_string())
        })
        .err()
        .unwrap();
        assert!(matches!(err, VenomError::Config(_)));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig::default().key_dir(dir.path());
        let name = unique("len");

        let channel =
            Channel::open_with_config(&name, 8, false, &name, SemMode::CreateNew, &config).unwrap();
        assert!(matches!(
            channel.write_range(0, 3, &[1, 2]),
            Err(VenomError::LengthMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            channel.write_masked_byte(8, 1, true),
            Err(VenomError::RangeExceeded { .. })
        ));
        assert!(matches!(
            channel.replace_all(&[0; 9]),
            Err(VenomError::TooLarge { max: 8, got: 9 })
        ));
    }
}
