//! System V key derivation
//!
//! System V keys are derived from an inode, so every key name is backed by a
//! zero-length marker file in the key directory. The file content is never
//! read; it only has to exist for as long as the key is in use.

use crate::error::{Result, VenomError};
use std::ffi::CString;
use std::fs::{DirBuilder, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A System V IPC key anchored to a marker file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcKey {
    name: String,
    path: PathBuf,
    key: libc::key_t,
}

impl IpcKey {
    /// Derive a key for `name`, creating `key_dir` and the marker file if needed
    pub fn derive(name: &str, project_id: u8, key_dir: &Path) -> Result<Self> {
        validate_name(name)?;
        let path = key_dir.join(name);

        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(key_dir)
            .map_err(|source| VenomError::KeyFile {
                path: key_dir.display().to_string(),
                source,
            })?;

        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .map_err(|source| VenomError::KeyFile {
                path: path.display().to_string(),
                source,
            })?;

        Self::from_marker(name, project_id, path)
    }

    /// Derive the key for a marker file somebody else created. Never creates
    /// anything; a missing file is a [`VenomError::KeyFile`] with
    /// [`io::ErrorKind::NotFound`].
    pub fn existing(name: &str, project_id: u8, key_dir: &Path) -> Result<Self> {
        validate_name(name)?;
        let path = key_dir.join(name);

        std::fs::metadata(&path).map_err(|source| VenomError::KeyFile {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_marker(name, project_id, path)
    }

    fn from_marker(name: &str, project_id: u8, path: PathBuf) -> Result<Self> {
        if project_id == 0 {
            return Err(VenomError::Config("ftok project id must be nonzero".into()));
        }

        let shown = path.display().to_string();
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| VenomError::Config(format!("key path '{}' contains NUL", shown)))?;

        // SAFETY: c_path is a valid NUL-terminated string
        let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(project_id)) };
        if key == -1 {
            return Err(VenomError::KeyDerive {
                path: shown,
                source: io::Error::last_os_error(),
            });
        }

        debug!(name, key, path = %shown, "derived ipc key");

        Ok(Self {
            name: name.to_string(),
            path,
            key,
        })
    }

    /// Remove the marker file. Failure is logged only.
    pub fn release(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "cannot remove key file");
        } else {
            debug!(path = %self.path.display(), "removed key file");
        }
    }

    /// Raw System V key
    #[inline(always)]
    pub fn raw(&self) -> libc::key_t {
        self.key
    }

    /// Key name as given by the caller
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the marker file
    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VenomError::Config("name must not be empty".into()));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(VenomError::Config(format!(
            "name '{}' must not contain '/' or NUL",
            name.escape_debug()
        )));
    }
    Ok(())
}
