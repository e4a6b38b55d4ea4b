//! Card-memory allocator contract.

use alloc::vec::Vec;

use thiserror::Error;

use crate::{CardAddress, MigrateError};

/// The card allocator could not satisfy a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("card memory exhausted ({requested} pages requested, huge {huge})")]
pub struct CardAllocError {
    pub requested: usize,
    pub huge: bool,
}

impl From<CardAllocError> for MigrateError {
    fn from(_: CardAllocError) -> Self {
        MigrateError::OutOfMemory
    }
}

/// Allocator for the accelerator's on-board memory.
///
/// With `huge` set, every address names a whole huge page.
pub trait CardMemoryAllocator: Send + Sync {
    /// Allocates `count` pages, all or nothing.
    fn allocate(&self, count: usize, huge: bool) -> Result<Vec<CardAddress>, CardAllocError>;

    fn release(&self, addresses: &[CardAddress], huge: bool);
}
