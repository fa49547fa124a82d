//! Error types for venom_shm

use std::io;
use thiserror::Error;

/// Result type for venom_shm operations
pub type Result<T> = std::result::Result<T, VenomError>;

/// Errors that can occur in channel operations
#[derive(Debug, Error)]
pub enum VenomError {
    /// Caller-correctable argument or configuration problem
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Failed to create the key marker file or its directory
    #[error("Failed to prepare key file '{path}': {source}")]
    KeyFile {
        path: String,
        #[source]
        source: io::Error,
    },

    /// ftok failed for the marker file
    #[error("Failed to derive IPC key from '{path}': {source}")]
    KeyDerive {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to create a new semaphore set
    #[error("Failed to create semaphore '{name}': {source}")]
    SemCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to attach to an existing semaphore set
    #[error("Failed to attach semaphore '{name}': {source}")]
    SemAttach {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Semaphore control operation failed
    #[error("Semaphore operation failed: {0}")]
    SemOp(#[source] io::Error),

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Existing segment size differs from the requested layout
    #[error("Shared memory '{name}' is {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Existing segment was set up with a different buffer mode or size
    #[error("Shared memory '{name}' layout mismatch: {reason}")]
    LayoutMismatch { name: String, reason: String },

    /// offset + length lies outside the region
    #[error("Range exceeded: offset {offset} + length {length} > size {size}")]
    RangeExceeded {
        offset: usize,
        length: usize,
        size: usize,
    },

    /// Payload length differs from the declared length
    #[error("Value buffer length {got} does not match the specified length {expected}")]
    LengthMismatch { expected: usize, got: usize },

    /// Payload does not fit into the region
    #[error("Buffer overflow: max {max} bytes, got {got} bytes")]
    TooLarge { max: usize, got: usize },

    /// Lock/unlock retry budget exhausted while writing
    #[error("Unable to write value after {attempts} attempts: {reason}")]
    WriteFailed { attempts: u32, reason: String },

    /// Lock or seqlock retry budget exhausted while reading
    #[error("Unable to read value after {attempts} attempts: {reason}")]
    ReadFailed { attempts: u32, reason: String },

    /// Operation on a channel that was already closed
    #[error("Channel '{0}' is closed")]
    Closed(String),
}

/// Coarse classification of [`VenomError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at construction, fixable by the caller
    Config,
    /// OS resource could not be created, attached or used
    Resource,
    /// Rejected before any memory access; nothing was mutated
    Range,
    /// Retry budget exhausted; the region keeps its previous state
    TransientLock,
}

impl VenomError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VenomError::Config(_) | VenomError::LayoutMismatch { .. } => ErrorKind::Config,
            VenomError::RangeExceeded { .. }
            | VenomError::LengthMismatch { .. }
            | VenomError::TooLarge { .. } => ErrorKind::Range,
            VenomError::WriteFailed { .. } | VenomError::ReadFailed { .. } => {
                ErrorKind::TransientLock
            }
            VenomError::KeyFile { .. }
            | VenomError::KeyDerive { .. }
            | VenomError::SemCreate { .. }
            | VenomError::SemAttach { .. }
            | VenomError::SemOp(_)
            | VenomError::ShmCreate { .. }
            | VenomError::ShmOpen { .. }
            | VenomError::Mmap(_)
            | VenomError::Truncate(_)
            | VenomError::SizeMismatch { .. }
            | VenomError::Closed(_) => ErrorKind::Resource,
        }
    }
}
