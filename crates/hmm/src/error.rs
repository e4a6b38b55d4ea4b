//! Error taxonomy for migration, mapping and fault resolution.

use thiserror::Error;

/// An errno-style code returned by the host memory manager for failures that do
/// not fall into one of the classified categories.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("errno {0}")]
pub struct HostError(pub i32);

impl HostError {
    /// Out of memory.
    pub const ENOMEM: Self = Self(12);
    /// Bad address.
    pub const EFAULT: Self = Self(14);
    /// Resource busy; the operation may be retried.
    pub const EBUSY: Self = Self(16);
    /// Invalid argument.
    pub const EINVAL: Self = Self(22);
}

/// Errors surfaced by the migration core.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateError {
    /// A bookkeeping allocation or a destination page allocation failed. The
    /// operation was rolled back in full.
    #[error("out of memory")]
    OutOfMemory,

    /// No virtual memory area intersects the requested range.
    #[error("no virtual memory area covers the requested range")]
    InvalidRange,

    /// Unknown access kind, missing notifier registration or malformed request.
    #[error("invalid argument")]
    InvalidArgument,

    /// The host-fault resolution loop ran out of time. Nothing was staged, the
    /// caller may retry.
    #[error("host fault resolution timed out")]
    Timeout,

    /// A non-blocking invalidation could not take the device migration lock.
    #[error("device migration lock is contended")]
    Busy,

    /// The host memory manager failed with an unclassified error code.
    #[error("host memory manager error: {0}")]
    Host(HostError),
}

impl From<HostError> for MigrateError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::ENOMEM => MigrateError::OutOfMemory,
            HostError::EFAULT => MigrateError::InvalidRange,
            HostError::EINVAL => MigrateError::InvalidArgument,
            other => MigrateError::Host(other),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, MigrateError>;
