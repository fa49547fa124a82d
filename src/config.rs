//! Channel configuration

use crate::error::{Result, VenomError};
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Directory holding the key marker files
pub const DEFAULT_KEY_DIR: &str = "/tmp/";

/// ftok project id used for semaphore keys
pub const SEM_PROJECT_ID: u8 = b'S';

/// Environment variable overriding [`ChannelConfig::key_dir`]
pub const ENV_KEY_DIR: &str = "VENOM_KEY_DIR";

/// Environment variable overriding [`RetryPolicy::max_retries`]
pub const ENV_MAX_RETRIES: &str = "VENOM_MAX_RETRIES";

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Directory of the zero-length marker files anchoring IPC keys
    pub key_dir: PathBuf,
    /// Project id passed to ftok for the semaphore key
    pub sem_project_id: u8,
    /// Number of semaphores in the set
    pub sem_members: u16,
    /// Value every member is raised to on creation (1 = unlocked mutex)
    pub sem_initial_value: i16,
    /// Permission bits for the semaphore set and shm object
    pub permissions: u32,
    /// How often an attacher checks that the creator finished initializing
    pub attach_poll_attempts: u32,
    /// Pause between attach checks
    pub attach_poll_interval: Duration,
    /// Retry budget for lock/unlock and seqlock reads
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
            sem_project_id: SEM_PROJECT_ID,
            sem_members: 1,
            sem_initial_value: 1,
            permissions: 0o666,
            attach_poll_attempts: 10,
            attach_poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl ChannelConfig {
    /// Defaults with `VENOM_KEY_DIR` and `VENOM_MAX_RETRIES` applied
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().with_env_overrides(lookup)
    }

    fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_KEY_DIR) {
            if dir.is_empty() {
                return Err(VenomError::Config(format!("{} is empty", ENV_KEY_DIR)));
            }
            self.key_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries = raw.trim().parse().map_err(|_| {
                VenomError::Config(format!("{} must be an integer, got '{}'", ENV_MAX_RETRIES, raw))
            })?;
        }
        Ok(self)
    }

    /// Use a different key directory
    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    /// Use a different retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sem_members == 0 {
            return Err(VenomError::Config("semaphore set needs at least one member".into()));
        }
        if self.sem_project_id == 0 {
            return Err(VenomError::Config("ftok project id must be nonzero".into()));
        }
        Ok(())
    }
}
