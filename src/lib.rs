//! venom_shm - Shared memory channels between independent processes
//!
//! A channel is a fixed-size byte region in POSIX shared memory plus a
//! System V semaphore. Two disciplines are available:
//!
//! - **Mutex**: every read and write runs under the semaphore
//! - **DoubleBuffer**: writers take the semaphore, readers use a seqlock over
//!   two buffers and never block
//!
//! Lock and read attempts are retried a bounded number of times and then
//! reported as errors instead of spinning forever.
//!
//! ```no_run
//! use venom_shm::{Channel, SemMode};
//!
//! let owner = Channel::open("plc_values", 256, true, "plc_values_lock", SemMode::CreateNew)?;
//! owner.write_range(8, 4, &42u32.to_le_bytes())?;
//!
//! let peer = Channel::open("plc_values", 256, true, "plc_values_lock", SemMode::AttachExisting)?;
//! let snapshot = peer.read_all()?;
//! assert_eq!(&snapshot[8..12], &42u32.to_le_bytes());
//! # Ok::<(), venom_shm::VenomError>(())
//! ```

pub mod error;
pub mod config;
pub mod retry;
pub mod key;
pub mod semaphore;
pub mod shm;
pub mod seqlock;
pub mod channel;
pub mod bindings;

pub use error::{ErrorKind, Result, VenomError};
pub use config::ChannelConfig;
pub use retry::RetryPolicy;
pub use key::IpcKey;
pub use semaphore::{SemMode, SemaphoreHandle};
pub use channel::{BufferMode, Channel};
