//! System V counting semaphore
//!
//! A handle either created the semaphore set (and tears it down again),
//! attached to a set somebody else created, or is invalid. Only the creator
//! ever removes the set and its key marker file.

use crate::config::ChannelConfig;
use crate::error::{Result, VenomError};
use crate::key::IpcKey;
use std::io;
use std::mem::MaybeUninit;
use std::sync::Mutex;
use tracing::{debug, warn};

/// How a semaphore handle comes into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemMode {
    /// Open a set another process created
    AttachExisting,
    /// Exclusively create the set; this handle becomes the owner
    CreateNew,
    /// Placeholder handle; every operation fails
    Invalid,
}

impl SemMode {
    /// Map the numeric creation type used across the C boundary
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SemMode::AttachExisting),
            1 => Some(SemMode::CreateNew),
            2 => Some(SemMode::Invalid),
            _ => None,
        }
    }

    /// Numeric creation type
    pub fn code(self) -> i32 {
        match self {
            SemMode::AttachExisting => 0,
            SemMode::CreateNew => 1,
            SemMode::Invalid => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SemState {
    Owner(libc::c_int),
    Attached(libc::c_int),
    Invalid,
}

/// Handle to a System V semaphore set
#[derive(Debug)]
pub struct SemaphoreHandle {
    state: SemState,
    key: Option<IpcKey>,
    members: u16,
    last_error: Mutex<Option<String>>,
}

impl SemaphoreHandle {
    /// Derive the key for `key_name` and create or attach according to `mode`
    pub fn open(key_name: &str, mode: SemMode, config: &ChannelConfig) -> Result<Self> {
        config.validate()?;
        match mode {
            SemMode::Invalid => {
                crate::key::validate_name(key_name)?;
                Ok(Self::invalid())
            }
            SemMode::CreateNew => {
                let key = IpcKey::derive(key_name, config.sem_project_id, &config.key_dir)?;
                Self::create(key, config)
            }
            SemMode::AttachExisting => {
                // Attaching never leaves a marker file behind; without one
                // there is no creator to attach to
                let key = IpcKey::existing(key_name, config.sem_project_id, &config.key_dir)
                    .map_err(|e| match e {
                        VenomError::KeyFile { source, .. }
                            if source.kind() == io::ErrorKind::NotFound =>
                        {
                            VenomError::SemAttach {
                                name: key_name.to_string(),
                                source,
                            }
                        }
                        other => other,
                    })?;
                Self::attach(key, config)
            }
        }
    }

    /// Exclusively create a semaphore set and raise every member to the
    /// configured initial value
    pub fn create(key: IpcKey, config: &ChannelConfig) -> Result<Self> {
        let members = config.sem_members;
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | (config.permissions & 0o777) as libc::c_int;

        // SAFETY: plain syscall wrapper
        let id = unsafe { libc::semget(key.raw(), libc::c_int::from(members), flags) };
        if id < 0 {
            return Err(VenomError::SemCreate {
                name: key.name().to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let mut ops: Vec<libc::sembuf> = (0..members)
            .map(|num| libc::sembuf {
                sem_num: num,
                sem_op: config.sem_initial_value,
                sem_flg: 0,
            })
            .collect();

        // SAFETY: ops holds `members` valid sembuf entries
        if unsafe { libc::semop(id, ops.as_mut_ptr(), ops.len()) } == -1 {
            let source = io::Error::last_os_error();
            remove_set(id);
            return Err(VenomError::SemCreate {
                name: key.name().to_string(),
                source,
            });
        }

        debug!(name = key.name(), key = key.raw(), sem_id = id, members, "created semaphore set");

        Ok(Self {
            state: SemState::Owner(id),
            key: Some(key),
            members,
            last_error: Mutex::new(None),
        })
    }

    /// Attach to an existing set.
    ///
    /// The creator may still be initializing, so this waits for a nonzero
    /// last-operation time. A timeout is recorded in [`last_error`] but does
    /// not fail construction.
    ///
    /// [`last_error`]: SemaphoreHandle::last_error
    pub fn attach(key: IpcKey, config: &ChannelConfig) -> Result<Self> {
        let members = config.sem_members;

        // SAFETY: plain syscall wrapper
        let id = unsafe { libc::semget(key.raw(), libc::c_int::from(members), 0) };
        if id < 0 {
            return Err(VenomError::SemAttach {
                name: key.name().to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let handle = Self {
            state: SemState::Attached(id),
            key: Some(key),
            members,
            last_error: Mutex::new(None),
        };

        let mut ready = false;
        for attempt in 0..config.attach_poll_attempts {
            match handle.last_op_time() {
                Ok(otime) if otime != 0 => {
                    ready = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => handle.record_error(&e),
            }
            if attempt + 1 < config.attach_poll_attempts {
                std::thread::sleep(config.attach_poll_interval);
            }
        }

        if ready {
            debug!(name = handle.key_name(), sem_id = id, "attached to semaphore set");
        } else {
            let e = io::Error::from_raw_os_error(libc::ETIME);
            warn!(
                name = handle.key_name(),
                sem_id = id,
                error = %e,
                "semaphore not initialized by its creator"
            );
            handle.record_error(&e);
        }

        Ok(handle)
    }

    /// A handle on which every operation fails
    pub fn invalid() -> Self {
        Self {
            state: SemState::Invalid,
            key: None,
            members: 0,
            last_error: Mutex::new(None),
        }
    }

    /// Blocking decrement by one. `false` if the operation failed.
    pub fn lock(&self) -> bool {
        self.apply(-1)
    }

    /// Increment by one. `false` if the operation failed.
    pub fn unlock(&self) -> bool {
        self.apply(1)
    }

    /// Current value of the first member
    pub fn value(&self) -> Result<i32> {
        let id = self.require_id()?;
        // SAFETY: GETVAL takes no fourth argument
        let value = unsafe { libc::semctl(id, 0, libc::GETVAL) };
        if value == -1 {
            let e = io::Error::last_os_error();
            self.record_error(&e);
            return Err(VenomError::SemOp(e));
        }
        Ok(value)
    }

    /// Text of the last failed operation, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|g| g.clone())
    }

    /// Semaphore set id, if the handle is valid
    pub fn id(&self) -> Option<i32> {
        match self.state {
            SemState::Owner(id) | SemState::Attached(id) => Some(id),
            SemState::Invalid => None,
        }
    }

    /// How this handle was created
    pub fn mode(&self) -> SemMode {
        match self.state {
            SemState::Owner(_) => SemMode::CreateNew,
            SemState::Attached(_) => SemMode::AttachExisting,
            SemState::Invalid => SemMode::Invalid,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.id().is_some()
    }

    #[inline]
    pub fn is_owner(&self) -> bool {
        matches!(self.state, SemState::Owner(_))
    }

    /// Number of semaphores in the set
    #[inline]
    pub fn members(&self) -> u16 {
        self.members
    }

    /// The key this handle was opened with
    pub fn key(&self) -> Option<&IpcKey> {
        self.key.as_ref()
    }

    /// Remove the set and the key file if this handle owns them.
    /// Attached handles only forget their id. Safe to call repeatedly.
    pub(crate) fn teardown(&mut self) {
        if let SemState::Owner(id) = self.state {
            remove_set(id);
            if let Some(key) = &self.key {
                key.release();
            }
            debug!(sem_id = id, "semaphore set torn down");
        }
        self.state = SemState::Invalid;
    }

    fn apply(&self, op: libc::c_short) -> bool {
        let id = match self.require_id() {
            Ok(id) => id,
            Err(_) => return false,
        };

        let mut sop = libc::sembuf {
            sem_num: 0,
            sem_op: op,
            sem_flg: 0,
        };

        // SAFETY: sop is a single valid sembuf
        if unsafe { libc::semop(id, &mut sop, 1) } == -1 {
            let e = io::Error::last_os_error();
            self.record_error(&e);
            return false;
        }
        true
    }

    fn last_op_time(&self) -> io::Result<libc::time_t> {
        let id = self
            .id()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let last = libc::c_int::from(self.members.saturating_sub(1));
        let mut ds = MaybeUninit::<libc::semid_ds>::zeroed();

        // SAFETY: IPC_STAT writes a semid_ds through the buf member of semun,
        // which is passed as a plain pointer
        if unsafe { libc::semctl(id, last, libc::IPC_STAT, ds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: zero-initialized and filled in by the kernel
        Ok(unsafe { ds.assume_init() }.sem_otime)
    }

    fn require_id(&self) -> Result<libc::c_int> {
        self.id().ok_or_else(|| {
            let e = io::Error::from_raw_os_error(libc::EINVAL);
            self.record_error(&e);
            VenomError::SemOp(e)
        })
    }

    fn record_error(&self, e: &io::Error) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(e.to_string());
        }
    }

    fn key_name(&self) -> &str {
        self.key.as_ref().map(IpcKey::name).unwrap_or("")
    }
}

impl Drop for SemaphoreHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn remove_set(id: libc::c_int) {
    // SAFETY: IPC_RMID takes no fourth argument
    if unsafe { libc::semctl(id, 0, libc::IPC_RMID) } == -1 {
        warn!(sem_id = id, error = %io::Error::last_os_error(), "error deleting semaphore");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> ChannelConfig {
        ChannelConfig {
            attach_poll_attempts: 2,
            attach_poll_interval: Duration::from_millis(10),
            ..ChannelConfig::default()
        }
        .key_dir(dir.path())
    }

    fn set_exists(key: libc::key_t) -> bool {
        unsafe { libc::semget(key, 0, 0) >= 0 }
    }

    #[test]
    fn test_create_lock_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let sem = SemaphoreHandle::open("sem_basic", SemMode::CreateNew, &config(&dir)).unwrap();

        assert!(sem.is_valid());
        assert!(sem.is_owner());
        assert_eq!(sem.mode(), SemMode::CreateNew);
        assert_eq!(sem.value().unwrap(), 1);

        assert!(sem.lock());
        assert_eq!(sem.value().unwrap(), 0);
        assert!(sem.unlock());
        assert_eq!(sem.value().unwrap(), 1);
        assert!(sem.last_error().is_none());
    }

    #[test]
    fn test_attach_shares_set_and_owner_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let owner = SemaphoreHandle::open("sem_shared", SemMode::CreateNew, &cfg).unwrap();
        let raw_key = owner.key().unwrap().raw();
        let key_path = owner.key().unwrap().path().to_path_buf();

        let attached = SemaphoreHandle::open("sem_shared", SemMode::AttachExisting, &cfg).unwrap();
        assert_eq!(attached.id(), owner.id());
        assert!(!attached.is_owner());
        assert!(attached.last_error().is_none());

        assert!(attached.lock());
        assert_eq!(owner.value().unwrap(), 0);
        assert!(attached.unlock());

        drop(attached);
        assert!(set_exists(raw_key));
        assert!(key_path.exists());
        assert_eq!(owner.value().unwrap(), 1);

        drop(owner);
        assert!(!set_exists(raw_key));
        assert!(!key_path.exists());
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let _owner = SemaphoreHandle::open("sem_excl", SemMode::CreateNew, &cfg).unwrap();

        let err = SemaphoreHandle::open("sem_excl", SemMode::CreateNew, &cfg).unwrap_err();
        assert!(matches!(err, VenomError::SemCreate { .. }));
    }

    #[test]
    fn test_attach_missing_set_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);

        // No marker file: fails without creating one
        let err = SemaphoreHandle::open("sem_missing", SemMode::AttachExisting, &cfg).unwrap_err();
        assert!(matches!(err, VenomError::SemAttach { .. }));
        assert!(!dir.path().join("sem_missing").exists());

        // Marker file but no set: semget fails, the marker is left alone
        let marker = IpcKey::derive("sem_orphan", cfg.sem_project_id, &cfg.key_dir).unwrap();
        let err = SemaphoreHandle::open("sem_orphan", SemMode::AttachExisting, &cfg).unwrap_err();
        assert!(matches!(err, VenomError::SemAttach { .. }));
        assert!(marker.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_attach_times_out_on_uninitialized_set() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let key = IpcKey::derive("sem_uninit", cfg.sem_project_id, &cfg.key_dir).unwrap();

        // Created but never operated on, so sem_otime stays zero
        let raw_id = unsafe { libc::semget(key.raw(), 1, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        assert!(raw_id >= 0);

        let attached = SemaphoreHandle::attach(key, &cfg).unwrap();
        assert!(attached.is_valid());
        assert!(attached.last_error().is_some());

        drop(attached);
        assert!(unsafe { libc::semctl(raw_id, 0, libc::IPC_RMID) } != -1);
    }

    #[test]
    fn test_invalid_handle_fails_operations() {
        let sem = SemaphoreHandle::invalid();
        assert!(!sem.is_valid());
        assert_eq!(sem.mode(), SemMode::Invalid);
        assert!(!sem.lock());
        assert!(!sem.unlock());
        assert!(sem.value().is_err());
        assert!(sem.last_error().is_some());
    }

    #[test]
    fn test_mode_codes() {
        for mode in [SemMode::AttachExisting, SemMode::CreateNew, SemMode::Invalid] {
            assert_eq!(SemMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(SemMode::from_code(1), Some(SemMode::CreateNew));
        assert_eq!(SemMode::from_code(7), None);
    }
}
