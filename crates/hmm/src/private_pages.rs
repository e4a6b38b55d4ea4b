//! Device-private page allocator.
//!
//! Device-private pages are host frame numbers with no RAM behind them: the host
//! memory manager hands out a range of them when the device registers a chunk of
//! device memory, and a page-table entry pointing at one tells the host that the data
//! lives on the card. The allocator keeps every page it has ever carved out of a chunk;
//! pages move between the free list and the residency registry, and are only given
//! back to the host when the device is torn down.

use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    DeviceId, DeviceMemoryChunk, DevicePagemapOps, FrameNumber, HostMemoryManager, MigrateError,
    Result,
};

/// LIFO list of free device-private pages.
struct FreeList {
    pages: Vec<FrameNumber>,
    /// Pages currently handed out; guards against double frees.
    allocated: BTreeSet<FrameNumber>,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            pages: Vec::new(),
            allocated: BTreeSet::new(),
        }
    }

    fn pop(&mut self) -> Option<FrameNumber> {
        let page = self.pages.pop()?;
        self.allocated.insert(page);
        Some(page)
    }

    fn push(&mut self, page: FrameNumber) -> bool {
        if !self.allocated.remove(&page) {
            return false;
        }
        self.pages.push(page);
        true
    }
}

/// Hands out device-private pages, growing by one chunk whenever it runs dry.
pub struct PrivatePageAllocator {
    owner: DeviceId,
    chunk_size: u64,
    host: Arc<dyn HostMemoryManager>,
    ops: Arc<dyn DevicePagemapOps>,
    free: Mutex<FreeList>,
    /// Also serializes growth.
    chunks: Mutex<Vec<DeviceMemoryChunk>>,
}

impl PrivatePageAllocator {
    pub fn new(
        owner: DeviceId,
        chunk_size: u64,
        host: Arc<dyn HostMemoryManager>,
        ops: Arc<dyn DevicePagemapOps>,
    ) -> Self {
        Self {
            owner,
            chunk_size,
            host,
            ops,
            free: Mutex::new(FreeList::new()),
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Takes a page off the free list, registering a new chunk if the list is empty.
    pub fn allocate_one(&self) -> Result<FrameNumber> {
        if let Some(page) = self.free.lock().pop() {
            return Ok(page);
        }

        let mut chunks = self.chunks.lock();
        // Another caller may have grown the pool while we waited for the chunk lock.
        if let Some(page) = self.free.lock().pop() {
            return Ok(page);
        }
        let chunk = self.grow(&mut chunks)?;

        let mut free = self.free.lock();
        for frame in chunk.frames().rev() {
            free.pages.push(frame);
        }
        free.pop().ok_or(MigrateError::OutOfMemory)
    }

    fn grow(&self, chunks: &mut Vec<DeviceMemoryChunk>) -> Result<DeviceMemoryChunk> {
        let chunk = self
            .host
            .register_device_memory_chunk(self.chunk_size, self.owner, self.ops.clone())
            .map_err(|err| {
                log::error!(
                    "device {}: failed to register {:#x} bytes of device memory: {}",
                    self.owner,
                    self.chunk_size,
                    err
                );
                MigrateError::OutOfMemory
            })?;
        if chunk.pages == 0 {
            self.host.unregister_device_memory_chunk(chunk.handle);
            return Err(MigrateError::OutOfMemory);
        }
        log::debug!(
            "device {}: added chunk {:?} with {} private pages at {}",
            self.owner,
            chunk.handle,
            chunk.pages,
            chunk.base
        );
        chunks.push(chunk);
        Ok(chunk)
    }

    /// Returns a page to the free list.
    pub fn free(&self, page: FrameNumber) {
        if !self.free.lock().push(page) {
            log::warn!("device {}: ignoring free of unallocated page {}", self.owner, page);
        }
    }

    /// Returns true if `page` belongs to one of this allocator's chunks.
    pub fn owns(&self, page: FrameNumber) -> bool {
        self.chunks.lock().iter().any(|chunk| chunk.contains(page))
    }

    pub fn is_allocated(&self, page: FrameNumber) -> bool {
        self.free.lock().allocated.contains(&page)
    }

    pub fn total_pages(&self) -> u64 {
        self.chunks.lock().iter().map(|chunk| chunk.pages).sum()
    }

    pub fn free_pages(&self) -> u64 {
        self.free.lock().pages.len() as u64
    }

    pub fn allocated_pages(&self) -> u64 {
        self.free.lock().allocated.len() as u64
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Unregisters every chunk and forgets all pages.
    pub fn teardown(&self) {
        let mut chunks = self.chunks.lock();
        {
            let mut free = self.free.lock();
            if !free.allocated.is_empty() {
                log::warn!(
                    "device {}: tearing down with {} private pages still in use",
                    self.owner,
                    free.allocated.len()
                );
            }
            free.pages.clear();
            free.allocated.clear();
        }
        for chunk in chunks.drain(..) {
            log::debug!("device {}: removing chunk {:?}", self.owner, chunk.handle);
            self.host.unregister_device_memory_chunk(chunk.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::EmulatedHost;
    use crate::{PAGE_SIZE, VirtualAddress};
    use std::thread;

    struct NoOps;

    impl DevicePagemapOps for NoOps {
        fn page_free(&self, _pfn: FrameNumber) {}

        fn migrate_to_ram(&self, _addr: VirtualAddress, _pfn: FrameNumber) -> Result<()> {
            Ok(())
        }
    }

    fn allocator(host: &Arc<EmulatedHost>, pages: u64) -> PrivatePageAllocator {
        PrivatePageAllocator::new(DeviceId(0), pages * PAGE_SIZE, host.clone(), Arc::new(NoOps))
    }

    #[test]
    fn grows_on_first_allocation() {
        let host = Arc::new(EmulatedHost::new());
        let pages = allocator(&host, 4);
        assert_eq!(pages.chunk_count(), 0);

        let first = pages.allocate_one().unwrap();
        assert_eq!(pages.chunk_count(), 1);
        assert_eq!(pages.total_pages(), 4);
        assert_eq!(pages.free_pages(), 3);
        assert!(pages.owns(first));
        assert!(pages.is_allocated(first));
    }

    #[test]
    fn hands_out_pages_in_chunk_order() {
        let host = Arc::new(EmulatedHost::new());
        let pages = allocator(&host, 4);
        let a = pages.allocate_one().unwrap();
        let b = pages.allocate_one().unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn exhaustion_grows_another_chunk() {
        let host = Arc::new(EmulatedHost::new());
        let pages = allocator(&host, 2);
        for _ in 0..5 {
            pages.allocate_one().unwrap();
        }
        assert_eq!(pages.chunk_count(), 3);
        assert_eq!(pages.total_pages(), 6);
        assert_eq!(pages.free_pages() + pages.allocated_pages(), pages.total_pages());
    }

    #[test]
    fn free_reuses_last_freed_page() {
        let host = Arc::new(EmulatedHost::new());
        let pages = allocator(&host, 4);
        let a = pages.allocate_one().unwrap();
        let _b = pages.allocate_one().unwrap();
        pages.free(a);
        assert_eq!(pages.allocate_one().unwrap(), a);
    }

    #[test]
    fn double_free_is_ignored() {
        let host = Arc::new(EmulatedHost::new());
        let pages = allocator(&host, 4);
        let a = pages.allocate_one().unwrap();
        pages.free(a);
        pages.free(a);
        assert_eq!(pages.free_pages(), 4);
        assert_eq!(pages.allocated_pages(), 0);
    }

    #[test]
    fn failed_growth_reports_out_of_memory() {
        let host = Arc::new(EmulatedHost::new());
        host.fail_chunk_registration(true);
        let pages = allocator(&host, 4);
        assert_eq!(pages.allocate_one(), Err(MigrateError::OutOfMemory));
        assert_eq!(pages.chunk_count(), 0);
        assert_eq!(host.registered_chunks(), 0);
    }

    #[test]
    fn teardown_unregisters_chunks() {
        let host = Arc::new(EmulatedHost::new());
        let pages = allocator(&host, 2);
        for _ in 0..3 {
            pages.allocate_one().unwrap();
        }
        assert_eq!(host.registered_chunks(), 2);
        pages.teardown();
        assert_eq!(host.registered_chunks(), 0);
        assert_eq!(pages.total_pages(), 0);
        assert_eq!(pages.free_pages(), 0);
    }

    #[test]
    fn concurrent_allocation_never_duplicates() {
        let host = Arc::new(EmulatedHost::new());
        let pages = Arc::new(allocator(&host, 8));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pages = pages.clone();
                thread::spawn(move || {
                    (0..16)
                        .map(|_| pages.allocate_one().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<FrameNumber> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 64);
        assert_eq!(pages.total_pages(), 64);
        assert_eq!(pages.free_pages(), 0);
    }
}
