//! An in-memory host memory manager.
//!
//! Processes are sets of areas and page-table entries; host frames and
//! device-private frames come from two disjoint bump allocators. Callbacks into
//! devices (notifiers, `page_free`, `migrate_to_ram`) are always made with the
//! host's own lock released, the way a real host drops its page-table locks before
//! calling out.

use std::collections::{BTreeMap, BTreeSet};

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    ChunkHandle, DeviceConfig, DeviceId, DeviceMemoryChunk, DevicePagemapOps, Direction,
    FrameNumber, HostError, HostMemoryManager, InvalidationEvent, InvalidationNotifier,
    InvalidationRange, Mapping, MigrateFlags, NotifierHandle, PAGE_SIZE, PageNumber, ProcessId,
    Result, SourcePage, StageRequest, StagedMigration, StagingHandle, VirtualAddress, Vma,
};

/// First host frame handed out.
const HOST_FRAME_BASE: u64 = 0x100;

/// First device-private frame handed out; far above any host frame.
const DEVICE_FRAME_BASE: u64 = 0x1000_0000;

/// Where the data of a virtual page currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    /// Not populated.
    None,
    Host(FrameNumber),
    /// Backed by a device-private frame.
    Device(FrameNumber),
}

#[derive(Debug, Clone, Copy)]
struct Area {
    vma: Vma,
    huge: bool,
}

#[derive(Default)]
struct Process {
    areas: Vec<Area>,
    ptes: BTreeMap<PageNumber, Residence>,
}

impl Process {
    fn area_at(&self, addr: VirtualAddress) -> Option<&Area> {
        self.areas
            .iter()
            .find(|area| addr >= area.vma.start && addr < area.vma.end)
    }

    fn residence(&self, page: PageNumber) -> Residence {
        self.ptes.get(&page).copied().unwrap_or(Residence::None)
    }
}

struct Chunk {
    chunk: DeviceMemoryChunk,
    owner: DeviceId,
    ops: Arc<dyn DevicePagemapOps>,
}

struct Staging {
    pid: ProcessId,
    /// Pages isolated for migration.
    pages: Vec<PageNumber>,
}

#[derive(Default)]
struct State {
    processes: BTreeMap<ProcessId, Process>,
    next_host_frame: u64,
    host_frames_left: Option<u64>,
    refs: BTreeMap<FrameNumber, u32>,
    locked: BTreeSet<FrameNumber>,

    chunks: Vec<Chunk>,
    next_device_frame: u64,
    next_chunk: u64,
    fail_chunks: bool,
    chunk_limit: Option<usize>,

    notifiers: BTreeMap<NotifierHandle, (ProcessId, Arc<dyn InvalidationNotifier>)>,
    next_notifier: u64,
    next_seq: u64,

    staged: BTreeMap<StagingHandle, Staging>,
    migrating: BTreeSet<(ProcessId, PageNumber)>,
    next_staging: u64,
    refused: BTreeSet<(ProcessId, PageNumber)>,
    always_busy: bool,
}

impl State {
    fn allocate_host(&mut self, order: u32) -> Option<FrameNumber> {
        if let Some(left) = self.host_frames_left.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        Some(self.bump_host(order))
    }

    fn bump_host(&mut self, order: u32) -> FrameNumber {
        let count = 1u64 << order;
        let head = self.next_host_frame.next_multiple_of(count);
        self.next_host_frame = head + count;
        for i in 0..count {
            self.refs.insert(FrameNumber::new(head + i), 1);
        }
        FrameNumber::new(head)
    }

    fn chunk_of(&self, pfn: FrameNumber) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.chunk.contains(pfn))
    }

    fn notifiers_of(&self, pid: ProcessId) -> Vec<Arc<dyn InvalidationNotifier>> {
        self.notifiers
            .values()
            .filter(|(owner, _)| *owner == pid)
            .map(|(_, notifier)| notifier.clone())
            .collect()
    }

    fn drop_frame(&mut self, frame: FrameNumber) {
        self.refs.remove(&frame);
    }
}

/// Software host memory manager.
pub struct EmulatedHost {
    state: Mutex<State>,
}

impl Default for EmulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_host_frame: HOST_FRAME_BASE,
                next_device_frame: DEVICE_FRAME_BASE,
                ..State::default()
            }),
        }
    }

    /// Adds an area of `pages` regular pages at `start` to `pid`.
    pub fn add_vma(&self, pid: ProcessId, start: VirtualAddress, pages: u64, huge: bool) {
        let vma = Vma::new(start, start + pages * PAGE_SIZE);
        self.state
            .lock()
            .processes
            .entry(pid)
            .or_default()
            .areas
            .push(Area { vma, huge });
    }

    pub fn vma_of(&self, pid: ProcessId, addr: VirtualAddress) -> Option<Vma> {
        let state = self.state.lock();
        state
            .processes
            .get(&pid)?
            .area_at(addr)
            .map(|area| area.vma)
    }

    /// Backs `count` pages at `addr` with fresh host frames. Pages of huge areas
    /// come from one naturally aligned block per huge page.
    pub fn populate(&self, pid: ProcessId, addr: VirtualAddress, count: u64) {
        let per_huge = DeviceConfig::default().pages_per_huge();
        let mut state = self.state.lock();
        let mut blocks: BTreeMap<PageNumber, FrameNumber> = BTreeMap::new();
        for i in 0..count {
            let page = (addr + i * PAGE_SIZE).page_number();
            let huge = state
                .processes
                .get(&pid)
                .and_then(|process| process.area_at(page.start()))
                .is_some_and(|area| area.huge);
            let frame = if huge {
                let head = PageNumber::new(page.as_u64() & !(per_huge - 1));
                let block = *blocks
                    .entry(head)
                    .or_insert_with(|| state.bump_host(per_huge.trailing_zeros()));
                block + (page - head)
            } else {
                state.bump_host(0)
            };
            state
                .processes
                .entry(pid)
                .or_default()
                .ptes
                .insert(page, Residence::Host(frame));
        }
    }

    /// Where the page at `addr` lives. Pages isolated for migration report where they
    /// lived before.
    pub fn residence(&self, pid: ProcessId, addr: VirtualAddress) -> Residence {
        let state = self.state.lock();
        state
            .processes
            .get(&pid)
            .map(|process| process.residence(addr.page_number()))
            .unwrap_or(Residence::None)
    }

    /// Number of blocks the host may still allocate for migrations and faults.
    pub fn limit_host_frames(&self, blocks: u64) {
        self.state.lock().host_frames_left = Some(blocks);
    }

    pub fn fail_chunk_registration(&self, fail: bool) {
        self.state.lock().fail_chunks = fail;
    }

    /// Refuses registration once `count` chunks are registered.
    pub fn limit_chunks(&self, count: usize) {
        self.state.lock().chunk_limit = Some(count);
    }

    pub fn registered_chunks(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn notifier_count(&self) -> usize {
        self.state.lock().notifiers.len()
    }

    pub fn locked_pages(&self) -> usize {
        self.state.lock().locked.len()
    }

    pub fn staged_migrations(&self) -> usize {
        self.state.lock().staged.len()
    }

    /// Makes every later commit refuse to move the page at `addr`.
    pub fn refuse_commit(&self, pid: ProcessId, addr: VirtualAddress) {
        self.state.lock().refused.insert((pid, addr.page_number()));
    }

    /// Makes `resolve_fault` report contention forever.
    pub fn always_busy(&self, busy: bool) {
        self.state.lock().always_busy = busy;
    }

    /// Drops the last reference to a device-private page, as the host does when it
    /// reclaims one through its own page lifecycle.
    pub fn release_device_page(&self, pfn: FrameNumber) {
        let ops = {
            let mut state = self.state.lock();
            state.drop_frame(pfn);
            state.chunk_of(pfn).map(|chunk| chunk.ops.clone())
        };
        if let Some(ops) = ops {
            ops.page_free(pfn);
        }
    }

    /// A CPU access to `addr`: populates missing pages and migrates card-resident
    /// pages back through their device.
    pub fn cpu_access(&self, pid: ProcessId, addr: VirtualAddress) -> Result<()> {
        let page = addr.page_number();
        let fault = {
            let mut state = self.state.lock();
            let residence = state
                .processes
                .get(&pid)
                .map(|process| process.residence(page))
                .unwrap_or(Residence::None);
            match residence {
                Residence::Host(_) => None,
                Residence::None => {
                    let frame = state.bump_host(0);
                    state
                        .processes
                        .entry(pid)
                        .or_default()
                        .ptes
                        .insert(page, Residence::Host(frame));
                    None
                }
                Residence::Device(pfn) => state.chunk_of(pfn).map(|chunk| (pfn, chunk.ops.clone())),
            }
        };
        match fault {
            Some((pfn, ops)) => ops.migrate_to_ram(addr, pfn),
            None => Ok(()),
        }
    }

    /// Delivers an invalidation of `[start, end)` to every notifier of `pid`.
    pub fn invalidate_range(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        end: VirtualAddress,
        event: InvalidationEvent,
        owner: Option<DeviceId>,
        blockable: bool,
    ) -> Vec<Result<()>> {
        let (notifiers, seq) = {
            let mut state = self.state.lock();
            state.next_seq += 1;
            (state.notifiers_of(pid), state.next_seq)
        };
        let range = InvalidationRange {
            start,
            end,
            event,
            owner,
            blockable,
        };
        notifiers
            .iter()
            .map(|notifier| notifier.invalidate(&range, seq))
            .collect()
    }
}

impl HostMemoryManager for EmulatedHost {
    fn find_vma(&self, pid: ProcessId, start: VirtualAddress, end: VirtualAddress) -> Option<Vma> {
        let state = self.state.lock();
        state
            .processes
            .get(&pid)?
            .areas
            .iter()
            .find(|area| area.vma.start < end && start < area.vma.end)
            .map(|area| area.vma)
    }

    fn is_huge_page(&self, pid: ProcessId, addr: VirtualAddress) -> bool {
        let state = self.state.lock();
        state
            .processes
            .get(&pid)
            .and_then(|process| process.area_at(addr))
            .is_some_and(|area| area.huge)
    }

    fn stage_migration(
        &self,
        request: &StageRequest,
    ) -> core::result::Result<StagedMigration, HostError> {
        let end = request.start + request.npages * PAGE_SIZE;
        {
            let state = self.state.lock();
            let process = state.processes.get(&request.pid).ok_or(HostError::EFAULT)?;
            if !process
                .area_at(request.start)
                .is_some_and(|area| area.vma.covers(request.start, request.npages))
            {
                return Err(HostError::EFAULT);
            }
        }

        self.invalidate_range(
            request.pid,
            request.start,
            end,
            InvalidationEvent::Migrate,
            Some(request.owner),
            true,
        );

        let mut state = self.state.lock();
        let first = request.start.page_number();
        let pages: Vec<PageNumber> = (0..request.npages).map(|i| first + i).collect();
        if pages
            .iter()
            .any(|&page| state.migrating.contains(&(request.pid, page)))
        {
            return Err(HostError::EBUSY);
        }

        let process = state.processes.get(&request.pid).ok_or(HostError::EFAULT)?;
        let movable = MigrateFlags::MIGRATE | MigrateFlags::WRITE;
        let src: Vec<SourcePage> = pages
            .iter()
            .map(|&page| match (process.residence(page), request.direction) {
                (Residence::None, Direction::Card) => SourcePage {
                    frame: None,
                    flags: movable,
                },
                (Residence::Host(frame), Direction::Card) => SourcePage {
                    frame: Some(frame),
                    flags: movable,
                },
                (Residence::Device(pfn), Direction::Host)
                    if state
                        .chunk_of(pfn)
                        .is_some_and(|chunk| chunk.owner == request.owner) =>
                {
                    SourcePage {
                        frame: Some(pfn),
                        flags: movable,
                    }
                }
                _ => SourcePage::ineligible(),
            })
            .collect();

        let isolated: Vec<PageNumber> = pages
            .iter()
            .zip(&src)
            .filter(|(_, source)| source.is_eligible())
            .map(|(&page, _)| page)
            .collect();
        for &page in &isolated {
            state.migrating.insert((request.pid, page));
        }

        state.next_staging += 1;
        let handle = StagingHandle(state.next_staging);
        state.staged.insert(
            handle,
            Staging {
                pid: request.pid,
                pages: isolated,
            },
        );

        let npages = src.len();
        Ok(StagedMigration {
            handle,
            start: request.start,
            src,
            dst: alloc::vec![None; npages],
        })
    }

    fn commit_staged(&self, staged: &mut StagedMigration) {
        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(staging) = state.staged.remove(&staged.handle) else {
                panic!("commit of unknown staging {:?}", staged.handle);
            };
            let pid = staging.pid;
            for page in &staging.pages {
                state.migrating.remove(&(pid, *page));
            }

            let first = staged.start.page_number();
            for index in 0..staged.npages() {
                if !staged.src[index].is_eligible() {
                    continue;
                }
                let page = first + index as u64;
                let Some(destination) = staged.dst[index] else {
                    continue;
                };
                state.locked.remove(&destination.frame);
                let device_destination = state.chunk_of(destination.frame).is_some();

                if state.refused.contains(&(pid, page)) {
                    staged.src[index].flags.remove(MigrateFlags::MIGRATE);
                    if device_destination {
                        released.push(destination.frame);
                    }
                    state.drop_frame(destination.frame);
                    continue;
                }

                let residence = if device_destination {
                    Residence::Device(destination.frame)
                } else {
                    Residence::Host(destination.frame)
                };
                if let Some(process) = state.processes.get_mut(&pid) {
                    process.ptes.insert(page, residence);
                }

                if let Some(source) = staged.src[index].frame {
                    state.drop_frame(source);
                    if state.chunk_of(source).is_some() {
                        released.push(source);
                    }
                }
            }
        }

        for pfn in released {
            let ops = self.state.lock().chunk_of(pfn).map(|chunk| chunk.ops.clone());
            if let Some(ops) = ops {
                ops.page_free(pfn);
            }
        }
    }

    fn abort_staged(&self, staged: StagedMigration) {
        let mut state = self.state.lock();
        let Some(staging) = state.staged.remove(&staged.handle) else {
            panic!("abort of unknown staging {:?}", staged.handle);
        };
        assert!(
            staged.dst.iter().all(Option::is_none),
            "staging aborted with destinations still attached"
        );
        for page in staging.pages {
            state.migrating.remove(&(staging.pid, page));
        }
    }

    fn resolve_fault(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        npages: u64,
        owner: DeviceId,
    ) -> core::result::Result<Vec<Option<Mapping>>, HostError> {
        let foreign = {
            let mut state = self.state.lock();
            if state.always_busy {
                return Err(HostError::EBUSY);
            }
            let first = start.page_number();
            let covered = state
                .processes
                .get(&pid)
                .and_then(|process| process.area_at(start))
                .is_some_and(|area| area.vma.covers(start, npages));
            if !covered {
                return Err(HostError::EFAULT);
            }
            if (0..npages).any(|i| state.migrating.contains(&(pid, first + i))) {
                return Err(HostError::EBUSY);
            }

            let mut mappings = Vec::new();
            let mut foreign = None;
            for i in 0..npages {
                let page = first + i;
                let residence = state
                    .processes
                    .get(&pid)
                    .map(|process| process.residence(page))
                    .unwrap_or(Residence::None);
                match residence {
                    Residence::None => {
                        let frame = state.allocate_host(0).ok_or(HostError::ENOMEM)?;
                        if let Some(process) = state.processes.get_mut(&pid) {
                            process.ptes.insert(page, Residence::Host(frame));
                        }
                        mappings.push(Some(Mapping::Host(frame)));
                    }
                    Residence::Host(frame) => mappings.push(Some(Mapping::Host(frame))),
                    Residence::Device(pfn) => match state.chunk_of(pfn) {
                        Some(chunk) if chunk.owner == owner => {
                            mappings.push(Some(Mapping::DevicePrivate(pfn)))
                        }
                        Some(chunk) => {
                            foreign = Some((page.start(), pfn, chunk.ops.clone()));
                            break;
                        }
                        None => mappings.push(None),
                    },
                }
            }
            match foreign {
                None => return Ok(mappings),
                Some(foreign) => foreign,
            }
        };

        // Data held by another device comes back first; the caller retries.
        let (addr, pfn, ops) = foreign;
        ops.migrate_to_ram(addr, pfn).map_err(|_| HostError::EFAULT)?;
        Err(HostError::EBUSY)
    }

    fn register_notifier(
        &self,
        pid: ProcessId,
        notifier: Arc<dyn InvalidationNotifier>,
    ) -> core::result::Result<NotifierHandle, HostError> {
        let mut state = self.state.lock();
        state.next_notifier += 1;
        let handle = NotifierHandle(state.next_notifier);
        state.notifiers.insert(handle, (pid, notifier));
        Ok(handle)
    }

    fn unregister_notifier(&self, handle: NotifierHandle) {
        self.state.lock().notifiers.remove(&handle);
    }

    fn lookup_physical_mapping(&self, pid: ProcessId, addr: VirtualAddress) -> Option<Mapping> {
        let state = self.state.lock();
        let page = addr.page_number();
        if state.migrating.contains(&(pid, page)) {
            return None;
        }
        match state.processes.get(&pid)?.residence(page) {
            Residence::Host(frame) => Some(Mapping::Host(frame)),
            Residence::Device(pfn) => Some(Mapping::DevicePrivate(pfn)),
            Residence::None => None,
        }
    }

    fn allocate_pages(
        &self,
        _pid: ProcessId,
        _addr: VirtualAddress,
        order: u32,
    ) -> Option<FrameNumber> {
        self.state.lock().allocate_host(order)
    }

    fn free_pages(&self, head: FrameNumber, order: u32) {
        let mut state = self.state.lock();
        for i in 0..1u64 << order {
            state.drop_frame(head + i);
        }
    }

    fn get_page(&self, frame: FrameNumber) {
        *self.state.lock().refs.entry(frame).or_insert(0) += 1;
    }

    fn put_page(&self, frame: FrameNumber) {
        let mut state = self.state.lock();
        if let Some(count) = state.refs.get_mut(&frame) {
            *count = count.saturating_sub(1);
        }
    }

    fn lock_page(&self, frame: FrameNumber) {
        let newly = self.state.lock().locked.insert(frame);
        assert!(newly, "frame {frame} locked twice");
    }

    fn unlock_page(&self, frame: FrameNumber) {
        self.state.lock().locked.remove(&frame);
    }

    fn register_device_memory_chunk(
        &self,
        size: u64,
        owner: DeviceId,
        ops: Arc<dyn DevicePagemapOps>,
    ) -> core::result::Result<DeviceMemoryChunk, HostError> {
        let mut state = self.state.lock();
        if state.fail_chunks || state.chunk_limit.is_some_and(|limit| state.chunks.len() >= limit) {
            return Err(HostError::ENOMEM);
        }
        let pages = size / PAGE_SIZE;
        let base = FrameNumber::new(state.next_device_frame);
        state.next_device_frame += pages;
        state.next_chunk += 1;
        let chunk = DeviceMemoryChunk {
            handle: ChunkHandle(state.next_chunk),
            base,
            pages,
        };
        state.chunks.push(Chunk { chunk, owner, ops });
        Ok(chunk)
    }

    fn unregister_device_memory_chunk(&self, handle: ChunkHandle) {
        self.state.lock().chunks.retain(|chunk| chunk.chunk.handle != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PID: ProcessId = ProcessId(1);

    #[test]
    fn stages_host_pages_for_the_card() {
        let host = EmulatedHost::new();
        host.add_vma(PID, VirtualAddress::new(0x10000), 4, false);
        host.populate(PID, VirtualAddress::new(0x10000), 2);

        let staged = host
            .stage_migration(&StageRequest {
                pid: PID,
                start: VirtualAddress::new(0x10000),
                npages: 4,
                direction: Direction::Card,
                owner: DeviceId(0),
            })
            .unwrap();
        assert_eq!(staged.eligible(), 4);
        assert!(staged.src[0].frame.is_some());
        assert!(staged.src[3].frame.is_none());
        assert!(host.lookup_physical_mapping(PID, VirtualAddress::new(0x10000)).is_none());
        assert_eq!(
            host.resolve_fault(PID, VirtualAddress::new(0x10000), 1, DeviceId(0)),
            Err(HostError::EBUSY)
        );

        host.abort_staged(staged);
        assert_eq!(host.staged_migrations(), 0);
        assert!(matches!(
            host.lookup_physical_mapping(PID, VirtualAddress::new(0x10000)),
            Some(Mapping::Host(_))
        ));
    }

    #[test]
    fn staging_outside_an_area_faults() {
        let host = EmulatedHost::new();
        host.add_vma(PID, VirtualAddress::new(0x10000), 1, false);
        let result = host.stage_migration(&StageRequest {
            pid: PID,
            start: VirtualAddress::new(0x10000),
            npages: 2,
            direction: Direction::Card,
            owner: DeviceId(0),
        });
        assert_eq!(result.err(), Some(HostError::EFAULT));
    }

    #[test]
    fn huge_areas_are_backed_by_aligned_blocks() {
        let host = EmulatedHost::new();
        let base = VirtualAddress::new(512 * PAGE_SIZE);
        host.add_vma(PID, base, 512, true);
        host.populate(PID, VirtualAddress::new(0), 1);
        host.populate(PID, base, 512);

        let Residence::Host(head) = host.residence(PID, base) else {
            panic!("head page not populated");
        };
        assert_eq!(head.as_u64() % 512, 0);
        assert_eq!(
            host.residence(PID, base + 9 * PAGE_SIZE),
            Residence::Host(head + 9)
        );
    }

    #[test]
    fn huge_blocks_are_aligned() {
        let host = EmulatedHost::new();
        host.populate(PID, VirtualAddress::new(0), 3);
        let head = host.allocate_pages(PID, VirtualAddress::new(0), 9).unwrap();
        assert_eq!(head.as_u64() % 512, 0);
    }
}
