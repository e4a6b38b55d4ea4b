//! DMA engine contract and completion signalling.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use crate::{CardAddress, PhysicalAddress, Scheduler};

/// A flag raised from a completion path (interrupt handler, accelerator
/// acknowledgement) and consumed by exactly one waiter.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Raises the flag.
    pub fn signal(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Blocks until the flag is raised, then clears it.
    pub fn wait(&self, scheduler: &dyn Scheduler) {
        scheduler.wait_until(&|| self.is_signaled());
        self.done.store(false, Ordering::Release);
    }
}

/// One copy handed to the DMA engine.
///
/// `host[i]` and `card[i]` describe the same page. With `huge` set every entry is the
/// base of a huge page.
#[derive(Debug, Clone, Copy)]
pub struct DmaRequest<'a> {
    pub host: &'a [PhysicalAddress],
    pub card: &'a [CardAddress],
    pub huge: bool,
}

impl DmaRequest<'_> {
    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }
}

/// The accelerator's DMA engine.
///
/// Both calls return once the copy is submitted. The engine raises `done` when the
/// copy has finished.
pub trait DmaEngine: Send + Sync {
    /// Copies card memory to host memory.
    fn trigger_copy_sync(&self, request: &DmaRequest<'_>, done: &Arc<Completion>);

    /// Copies host memory to card memory.
    fn trigger_copy_offload(&self, request: &DmaRequest<'_>, done: &Arc<Completion>);
}

/// Which DMA command path a copy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaClass {
    Sync,
    Offload,
}

/// A DMA command path: submissions are serialized by `lock`, which stays held until
/// the copy completes.
#[derive(Debug, Default)]
pub(crate) struct DmaChannel {
    lock: Mutex<()>,
    completion: Arc<Completion>,
}

impl DmaChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Submits `request` on `engine` and blocks until it completes.
    pub(crate) fn copy(
        &self,
        class: DmaClass,
        engine: &dyn DmaEngine,
        scheduler: &dyn Scheduler,
        request: &DmaRequest<'_>,
    ) {
        let _guard: MutexGuard<'_, ()> = self.lock.lock();
        log::debug!("dma {:?}: {} entries (huge {})", class, request.len(), request.huge);
        match class {
            DmaClass::Sync => engine.trigger_copy_sync(request, &self.completion),
            DmaClass::Offload => engine.trigger_copy_offload(request, &self.completion),
        }
        self.completion.wait(scheduler);
        log::debug!("dma {:?} completed", class);
    }
}
