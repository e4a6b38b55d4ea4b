//! Contract with the host memory manager.
//!
//! The migration core never walks page tables or swaps page-table entries itself.
//! Everything that touches the host's view of an address space goes through
//! [`HostMemoryManager`]; the host in turn calls back into the device through
//! [`InvalidationNotifier`] (range teardown) and [`DevicePagemapOps`] (device-private
//! page lifecycle and CPU faults on card-resident pages).

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;

use crate::{DeviceId, FrameNumber, HostError, PAGE_SIZE, ProcessId, Result, VirtualAddress};

/// Where a page lives, or where it is being moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host RAM.
    Host,
    /// Accelerator on-board memory.
    Card,
}

/// A virtual memory area of a host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl Vma {
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self { start, end }
    }

    /// Returns true if `[start, start + npages)` lies entirely inside this area.
    pub fn covers(&self, start: VirtualAddress, npages: u64) -> bool {
        let end = start.as_u64() + npages * PAGE_SIZE;
        start >= self.start && end <= self.end.as_u64()
    }
}

bitflags! {
    /// Per-page state of a staged migration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MigrateFlags: u8 {
        /// The page can be moved. Cleared by the host on pages it refuses at commit.
        const MIGRATE = 1 << 0;
        /// The mapping is writable; propagated to the destination.
        const WRITE = 1 << 1;
        /// The destination page is locked for the duration of the migration.
        const LOCKED = 1 << 2;
    }
}

/// Source side of one staged page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePage {
    /// The frame currently backing the page, if the host isolated one.
    pub frame: Option<FrameNumber>,
    pub flags: MigrateFlags,
}

impl SourcePage {
    pub const fn ineligible() -> Self {
        Self {
            frame: None,
            flags: MigrateFlags::empty(),
        }
    }

    pub const fn is_eligible(&self) -> bool {
        self.flags.contains(MigrateFlags::MIGRATE)
    }
}

/// Destination side of one staged page, filled in by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationPage {
    pub frame: FrameNumber,
    pub flags: MigrateFlags,
}

/// Opaque handle the host uses to find its staging state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StagingHandle(pub u64);

/// Parameters of [`HostMemoryManager::stage_migration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRequest {
    pub pid: ProcessId,
    pub start: VirtualAddress,
    pub npages: u64,
    /// Selects which pages the host isolates: ordinary RAM pages when moving to the
    /// card, device-private pages owned by `owner` when moving to the host.
    pub direction: Direction,
    pub owner: DeviceId,
}

/// A migration the host has staged: the source pages are isolated and their
/// page-table entries replaced by migration entries until the migration is committed
/// or aborted.
#[derive(Debug)]
pub struct StagedMigration {
    pub handle: StagingHandle,
    pub start: VirtualAddress,
    pub src: Vec<SourcePage>,
    pub dst: Vec<Option<DestinationPage>>,
}

impl StagedMigration {
    pub fn npages(&self) -> usize {
        self.src.len()
    }

    /// Number of pages the host reported as movable.
    pub fn eligible(&self) -> usize {
        self.src.iter().filter(|page| page.is_eligible()).count()
    }

    /// After commit, true if page `index` moved to its destination.
    pub fn moved(&self, index: usize) -> bool {
        self.src[index].is_eligible() && self.dst[index].is_some()
    }
}

/// Result of a direct page-table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// Backed by a host RAM frame.
    Host(FrameNumber),
    /// Backed by a device-private frame; the data lives on a card.
    DevicePrivate(FrameNumber),
}

/// Why the host is invalidating a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationEvent {
    Unmap,
    Clear,
    Protection,
    Release,
    /// A page migration; `owner` names the device driving it.
    Migrate,
}

/// A range invalidation delivered to an [`InvalidationNotifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationRange {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub event: InvalidationEvent,
    pub owner: Option<DeviceId>,
    /// False when the caller runs in a context that must not sleep or spin.
    pub blockable: bool,
}

/// Callback the host invokes when a registered address range changes.
pub trait InvalidationNotifier: Send + Sync {
    /// Tears down any device state covering `range`.
    ///
    /// Returns [`MigrateError::Busy`](crate::MigrateError::Busy) if the range could not
    /// be torn down without blocking; the host retries later.
    fn invalidate(&self, range: &InvalidationRange, cur_seq: u64) -> Result<()>;
}

/// Handle of a registered notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierHandle(pub u64);

/// Callbacks the host makes on device-private pages.
pub trait DevicePagemapOps: Send + Sync {
    /// The host dropped its last reference to a device-private page.
    fn page_free(&self, pfn: FrameNumber);

    /// A CPU touched `addr`, which is backed by the device-private page `pfn`. The
    /// device finds the faulting process through the context owning the page.
    fn migrate_to_ram(&self, addr: VirtualAddress, pfn: FrameNumber) -> Result<()>;
}

/// Handle of a registered device-memory chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkHandle(pub u64);

/// A contiguous range of device-private frames registered with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemoryChunk {
    pub handle: ChunkHandle,
    pub base: FrameNumber,
    pub pages: u64,
}

impl DeviceMemoryChunk {
    pub fn frames(&self) -> impl DoubleEndedIterator<Item = FrameNumber> + use<> {
        let base = self.base;
        (0..self.pages).map(move |i| base + i)
    }

    pub fn contains(&self, pfn: FrameNumber) -> bool {
        pfn >= self.base && pfn - self.base < self.pages
    }
}

/// The host memory manager.
pub trait HostMemoryManager: Send + Sync {
    /// Finds the area of `pid` intersecting `[start, end)`.
    fn find_vma(&self, pid: ProcessId, start: VirtualAddress, end: VirtualAddress) -> Option<Vma>;

    /// Returns true if `addr` is currently backed by a transparent huge page.
    fn is_huge_page(&self, pid: ProcessId, addr: VirtualAddress) -> bool;

    /// Isolates the pages of a range for migration and reports which can move.
    fn stage_migration(
        &self,
        request: &StageRequest,
    ) -> core::result::Result<StagedMigration, HostError>;

    /// Swaps the page-table entries of every page whose source is eligible and whose
    /// destination is set, then releases the staging state.
    ///
    /// Pages the host refuses have [`MigrateFlags::MIGRATE`] cleared on their source.
    /// The host drops the device's references to refused destinations; refused
    /// device-private destinations come back through [`DevicePagemapOps::page_free`],
    /// as do device-private sources that were moved away.
    fn commit_staged(&self, staged: &mut StagedMigration);

    /// Restores every source page and releases the staging state. Destinations must
    /// already have been released by the caller.
    fn abort_staged(&self, staged: StagedMigration);

    /// Faults `[start, start + npages)` in with write permission. Pages that are
    /// device-private to `owner` are reported without being migrated.
    fn resolve_fault(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        npages: u64,
        owner: DeviceId,
    ) -> core::result::Result<Vec<Option<Mapping>>, HostError>;

    fn register_notifier(
        &self,
        pid: ProcessId,
        notifier: Arc<dyn InvalidationNotifier>,
    ) -> core::result::Result<NotifierHandle, HostError>;

    fn unregister_notifier(&self, handle: NotifierHandle);

    /// Walks the page tables of `pid` for `addr`.
    fn lookup_physical_mapping(&self, pid: ProcessId, addr: VirtualAddress) -> Option<Mapping>;

    /// Allocates `1 << order` contiguous host frames for `addr`.
    fn allocate_pages(
        &self,
        pid: ProcessId,
        addr: VirtualAddress,
        order: u32,
    ) -> Option<FrameNumber>;

    /// Drops the allocation reference of a block returned by
    /// [`allocate_pages`](Self::allocate_pages).
    fn free_pages(&self, head: FrameNumber, order: u32);

    fn get_page(&self, frame: FrameNumber);
    fn put_page(&self, frame: FrameNumber);
    fn lock_page(&self, frame: FrameNumber);
    fn unlock_page(&self, frame: FrameNumber);

    /// Reserves `size` bytes of host physical address space, remaps it as
    /// device-private memory owned by `owner` and returns its frames.
    fn register_device_memory_chunk(
        &self,
        size: u64,
        owner: DeviceId,
        ops: Arc<dyn DevicePagemapOps>,
    ) -> core::result::Result<DeviceMemoryChunk, HostError>;

    fn unregister_device_memory_chunk(&self, handle: ChunkHandle);
}

/// Time and blocking waits.
pub trait Scheduler: Send + Sync {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Gives other execution contexts a chance to run.
    fn yield_now(&self);

    /// Blocks until `condition` holds.
    fn wait_until(&self, condition: &dyn Fn() -> bool) {
        while !condition() {
            self.yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vma_covers_whole_range_only() {
        let vma = Vma::new(VirtualAddress::new(0x1000), VirtualAddress::new(0x5000));
        assert!(vma.covers(VirtualAddress::new(0x1000), 4));
        assert!(!vma.covers(VirtualAddress::new(0x2000), 4));
        assert!(!vma.covers(VirtualAddress::new(0x0), 1));
    }

    #[test]
    fn staged_migration_reports_moved_pages() {
        let mut staged = StagedMigration {
            handle: StagingHandle(1),
            start: VirtualAddress::new(0),
            src: alloc::vec![
                SourcePage {
                    frame: Some(FrameNumber::new(1)),
                    flags: MigrateFlags::MIGRATE,
                },
                SourcePage::ineligible(),
            ],
            dst: alloc::vec![None, None],
        };
        assert_eq!(staged.eligible(), 1);
        assert!(!staged.moved(0));

        staged.dst[0] = Some(DestinationPage {
            frame: FrameNumber::new(9),
            flags: MigrateFlags::LOCKED,
        });
        assert!(staged.moved(0));
        assert!(!staged.moved(1));
    }

    #[test]
    fn chunk_frames() {
        let chunk = DeviceMemoryChunk {
            handle: ChunkHandle(0),
            base: FrameNumber::new(0x100),
            pages: 4,
        };
        assert_eq!(chunk.frames().last(), Some(FrameNumber::new(0x103)));
        assert!(chunk.contains(FrameNumber::new(0x102)));
        assert!(!chunk.contains(FrameNumber::new(0x104)));
    }
}
