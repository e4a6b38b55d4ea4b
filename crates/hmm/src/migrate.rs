//! Migration coordinator.
//!
//! Both directions run the same protocol:
//!
//! 1. the host stages the range and reports which pages can move;
//! 2. under the migration lock, the range's accelerator translations are removed and
//!    invalidated, destination pages are staged and locked, and card memory is
//!    allocated (towards the card) or given back (towards the host);
//! 3. with the lock dropped, the core waits for the accelerator to acknowledge the
//!    invalidation and for the DMA copy to finish;
//! 4. under the lock again, the host commits the staged migration and the range is
//!    remapped at its new location.
//!
//! A failure in step 2 releases every staged destination, aborts the staged migration
//! and, once the accelerator has acknowledged the invalidation, puts the removed
//! translations back, so the range ends up exactly as it was.
//!
//! A huge request moves a granule as one huge card page only when every sub-page of
//! it moves. The moving sub-pages of any other granule move as regular pages, and
//! such a granule is mapped with regular entries.

use alloc::{sync::Arc, vec, vec::Vec};

use crate::{
    CardAddress, Completion, ContextId, Device, DestinationPage, Direction, DmaClass, DmaRequest,
    FrameNumber, MigrateError, MigrateFlags, Mapping, PAGE_SIZE, PhysicalAddress, ProcessId,
    ResidentPage, Result, StageRequest, StagedMigration, TLB_CTID_BITS, TlbTarget, VirtualAddress,
    Vma,
};

/// One migration: a granule-aligned range of one process, on behalf of one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationRequest {
    pub ctid: ContextId,
    pub pid: ProcessId,
    /// First byte of the range, aligned to the granule size.
    pub start: VirtualAddress,
    /// Length in regular pages; a whole number of granules.
    pub npages: u64,
    /// Migrate in units of huge pages.
    pub huge: bool,
    /// The area the range lies in.
    pub vma: Vma,
}

impl MigrationRequest {
    pub fn end(&self) -> VirtualAddress {
        self.start + self.npages * PAGE_SIZE
    }

    fn page_address(&self, index: usize) -> VirtualAddress {
        self.start + index as u64 * PAGE_SIZE
    }
}

/// Where a page ends up once the migration commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Nothing to map.
    Absent,
    /// The page is not moving; it is already where the direction wants it.
    Resolved(TlbTarget),
    /// The page moves; `host` and `card` are the two ends of the copy.
    Move {
        host: Option<PhysicalAddress>,
        card: Option<CardAddress>,
    },
}

impl Slot {
    fn copy_ends(&self) -> Option<(PhysicalAddress, CardAddress)> {
        match *self {
            Slot::Move {
                host: Some(host),
                card: Some(card),
            } => Some((host, card)),
            _ => None,
        }
    }
}

/// Base of the block of `block_size` bytes that `addresses` fill page by page, in
/// order, if they do.
fn block_base(addresses: impl Iterator<Item = Option<u64>>, block_size: u64) -> Option<u64> {
    let mut base = None;
    for (offset, address) in addresses.enumerate() {
        let address = address?;
        let first = *base.get_or_insert(address);
        if address != first + offset as u64 * PAGE_SIZE {
            return None;
        }
    }
    base.filter(|base| base % block_size == 0)
}

/// The single huge translation covering `pages`, if they all point into one huge
/// block on the same side.
fn huge_target(pages: &[Option<TlbTarget>], block_size: u64) -> Option<TlbTarget> {
    let first = (*pages.first()?)?;
    let raw = pages.iter().map(|&page| {
        page.filter(|target| target.direction() == first.direction())
            .map(|target| target.raw())
    });
    block_base(raw, block_size).map(|_| first)
}

/// Destinations acquired so far, in acquisition order.
#[derive(Default)]
struct Staging {
    /// Referenced and locked device-private pages.
    device_pages: Vec<FrameNumber>,
    /// Host blocks as (head, order).
    host_blocks: Vec<(FrameNumber, u32)>,
    /// Locked host frames.
    host_locked: Vec<FrameNumber>,
}

pub(crate) struct MigrationCoordinator<'a> {
    device: &'a Device,
}

impl<'a> MigrationCoordinator<'a> {
    pub(crate) fn new(device: &'a Device) -> Self {
        Self { device }
    }

    fn validate(&self, request: &MigrationRequest) -> Result<u64> {
        let config = &self.device.config;
        let granule = config.granule_pages(request.huge);
        let granule_size = config.tlb(request.huge).page_size();

        if request.npages == 0
            || request.npages % granule != 0
            || !request.start.is_aligned(granule_size)
            || u64::from(request.ctid.0) >= 1 << TLB_CTID_BITS
        {
            log::error!("device {}: malformed migration {:?}", self.device.id, request);
            return Err(MigrateError::InvalidArgument);
        }
        if !request.vma.covers(request.start, request.npages) {
            log::error!(
                "device {}: [{}, {}) is outside its area",
                self.device.id,
                request.start,
                request.end()
            );
            return Err(MigrateError::InvalidRange);
        }
        Ok(request.npages / granule)
    }

    pub(crate) fn run(&self, request: &MigrationRequest, direction: Direction) -> Result<()> {
        let device = self.device;
        let granules = self.validate(request)?;
        let notifier = device.notifier(request.pid);
        let seq = notifier.as_ref().map(|notifier| notifier.read_begin());

        log::debug!(
            "device {}: migrating [{}, {}) to {:?}, ctid {}, pid {}, huge {}",
            device.id,
            request.start,
            request.end(),
            direction,
            request.ctid,
            request.pid,
            request.huge
        );

        let mut staged = device
            .host
            .stage_migration(&StageRequest {
                pid: request.pid,
                start: request.start,
                npages: request.npages,
                direction,
                owner: device.id,
            })
            .map_err(|err| {
                log::error!("device {}: failed to stage migration: {}", device.id, err);
                MigrateError::from(err)
            })?;
        assert_eq!(
            staged.npages() as u64,
            request.npages,
            "host staged a different number of pages than requested"
        );
        log::debug!(
            "device {}: staged {} pages, {} eligible",
            device.id,
            staged.npages(),
            staged.eligible()
        );

        let invalidated = Arc::new(Completion::new());
        let guard = device.migration_lock.lock();
        let removed = device.tlb.remove(
            request.pid,
            request.start,
            granules,
            request.huge,
            &invalidated,
        );

        let mut staging = Staging::default();
        let slots = match direction {
            Direction::Card => self.stage_to_card(request, &mut staged, &mut staging),
            Direction::Host => self.stage_to_host(request, &mut staged, &mut staging),
        };
        let slots = match slots {
            Ok(slots) => slots,
            Err(err) => {
                self.roll_back(request, staged, staging);
                // A late invalidation would wipe entries restored before it.
                invalidated.wait(device.scheduler.as_ref());
                device.tlb.restore(request.pid, &removed);
                drop(guard);
                return Err(err);
            }
        };
        drop(guard);

        invalidated.wait(device.scheduler.as_ref());
        self.copy(request, &slots, direction);

        let _guard = device.migration_lock.lock();
        device.host.commit_staged(&mut staged);

        let stale = match (&notifier, seq) {
            (Some(notifier), Some(seq)) => notifier.is_stale(seq),
            _ => false,
        };
        if stale {
            log::warn!(
                "device {}: [{}, {}) was invalidated during migration, leaving it unmapped",
                device.id,
                request.start,
                request.end()
            );
            return Ok(());
        }

        let targets = self.targets(request, &staged, &slots, direction);
        let mapped = device.remap(request.ctid, request.pid, request.start, request.huge, &targets);
        log::debug!(
            "device {}: migration to {:?} committed, {} translations over {} granules",
            device.id,
            direction,
            mapped,
            granules
        );
        Ok(())
    }

    /// Recovers the current location of a page that is not moving. Only pages that
    /// already live where `direction` points are mapped.
    fn resolve(&self, request: &MigrationRequest, index: usize, direction: Direction) -> Slot {
        let addr = request.page_address(index);
        let mapping = self.device.host.lookup_physical_mapping(request.pid, addr);
        log::trace!("page table walk at {}: {:?}", addr, mapping);
        match (mapping, direction) {
            (Some(Mapping::Host(frame)), Direction::Host) => {
                Slot::Resolved(TlbTarget::Host(frame.start()))
            }
            (Some(Mapping::DevicePrivate(pfn)), Direction::Card) => {
                match self.device.residency.lookup(pfn) {
                    Some((_, page)) => Slot::Resolved(TlbTarget::Card(page.card_address)),
                    None => Slot::Absent,
                }
            }
            _ => Slot::Absent,
        }
    }

    fn destination_flags(source: MigrateFlags) -> MigrateFlags {
        let mut flags = MigrateFlags::LOCKED;
        if source.contains(MigrateFlags::WRITE) {
            flags |= MigrateFlags::WRITE;
        }
        flags
    }

    /// Granules of a huge request whose every sub-page is eligible, ascending.
    fn whole_granules(&self, request: &MigrationRequest, staged: &StagedMigration) -> Vec<usize> {
        if !request.huge {
            return Vec::new();
        }
        let granule = self.device.config.granule_pages(true) as usize;
        staged
            .src
            .chunks(granule)
            .enumerate()
            .filter(|(_, sources)| sources.iter().all(|source| source.is_eligible()))
            .map(|(index, _)| index)
            .collect()
    }

    fn stage_to_card(
        &self,
        request: &MigrationRequest,
        staged: &mut StagedMigration,
        staging: &mut Staging,
    ) -> Result<Vec<Slot>> {
        let device = self.device;
        let host = device.host.as_ref();
        let granule = device.config.granule_pages(request.huge) as usize;
        let mut slots = vec![Slot::Absent; staged.npages()];
        // (page index, device page) of every page that moves.
        let mut moving: Vec<(usize, FrameNumber)> = Vec::new();

        for (index, slot) in slots.iter_mut().enumerate() {
            let source = staged.src[index];
            if !source.is_eligible() {
                *slot = self.resolve(request, index, Direction::Card);
                continue;
            }

            let pfn = device.pages.allocate_one().inspect_err(|_| {
                log::error!(
                    "device {}: no device page for {} ({} of {} staged)",
                    device.id,
                    request.page_address(index),
                    moving.len(),
                    staged.eligible()
                );
            })?;
            host.get_page(pfn);
            host.lock_page(pfn);
            staging.device_pages.push(pfn);
            staged.dst[index] = Some(DestinationPage {
                frame: pfn,
                flags: Self::destination_flags(source.flags),
            });
            log::trace!("page {} -> device page {}", index, pfn);
            moving.push((index, pfn));
        }

        if moving.is_empty() {
            return Ok(slots);
        }

        let whole = self.whole_granules(request, staged);
        let (in_blocks, loose): (Vec<_>, Vec<_>) = moving
            .into_iter()
            .partition(|&(index, _)| whole.binary_search(&(index / granule)).is_ok());

        if !whole.is_empty() {
            let blocks = device
                .card
                .allocate(whole.len(), true)
                .inspect_err(|err| log::error!("device {}: {}", device.id, err))?;
            let addresses: Vec<CardAddress> = in_blocks
                .iter()
                .map(|&(index, _)| {
                    let block = blocks[whole.partition_point(|&g| g < index / granule)];
                    block + (index % granule) as u64 * PAGE_SIZE
                })
                .collect();
            self.attach(request, staged, &mut slots, &in_blocks, &addresses, true);
        }
        if !loose.is_empty() {
            let addresses = match device.card.allocate(loose.len(), false) {
                Ok(addresses) => addresses,
                Err(err) => {
                    log::error!("device {}: {}", device.id, err);
                    // Blocks attached above go back through the registry.
                    let attached: Vec<FrameNumber> =
                        in_blocks.iter().map(|&(_, pfn)| pfn).collect();
                    device.residency.vacate(&attached);
                    return Err(err.into());
                }
            };
            self.attach(request, staged, &mut slots, &loose, &addresses, false);
        }
        Ok(slots)
    }

    /// Records `moving[i]` as resident at `addresses[i]` and marks it for the copy.
    fn attach(
        &self,
        request: &MigrationRequest,
        staged: &StagedMigration,
        slots: &mut [Slot],
        moving: &[(usize, FrameNumber)],
        addresses: &[CardAddress],
        huge: bool,
    ) {
        for (&(index, pfn), &card_address) in moving.iter().zip(addresses) {
            self.device.residency.attach(
                request.ctid,
                ResidentPage {
                    pfn,
                    card_address,
                    huge,
                },
            );
            slots[index] = Slot::Move {
                host: staged.src[index].frame.map(FrameNumber::start),
                card: Some(card_address),
            };
        }
    }

    fn stage_to_host(
        &self,
        request: &MigrationRequest,
        staged: &mut StagedMigration,
        staging: &mut Staging,
    ) -> Result<Vec<Slot>> {
        let device = self.device;
        let host = device.host.as_ref();
        let granule = device.config.granule_pages(request.huge) as usize;
        let whole = self.whole_granules(request, staged);
        let mut slots = vec![Slot::Absent; staged.npages()];
        let mut vacated = Vec::new();

        for head in (0..staged.npages()).step_by(granule) {
            let block = if whole.binary_search(&(head / granule)).is_ok() {
                Some(self.allocate_host(request, head, granule.trailing_zeros(), staging)?)
            } else {
                None
            };

            for index in head..head + granule {
                let source = staged.src[index];
                if !source.is_eligible() {
                    slots[index] = self.resolve(request, index, Direction::Host);
                    continue;
                }
                let frame = match block {
                    Some(block) => block + (index - head) as u64,
                    None => self.allocate_host(request, index, 0, staging)?,
                };
                host.lock_page(frame);
                staging.host_locked.push(frame);
                staged.dst[index] = Some(DestinationPage {
                    frame,
                    flags: Self::destination_flags(source.flags),
                });

                let card = match source.frame.and_then(|pfn| device.residency.lookup(pfn)) {
                    Some((_, page)) => {
                        vacated.push(page.pfn);
                        Some(page.card_address)
                    }
                    None => {
                        log::warn!(
                            "device {}: device page at {} has no card memory, nothing to copy",
                            device.id,
                            request.page_address(index)
                        );
                        None
                    }
                };
                log::trace!("page {} -> host frame {}", index, frame);
                slots[index] = Slot::Move {
                    host: Some(frame.start()),
                    card,
                };
            }
        }

        // Nothing can fail past this point; the vacated card memory is free before
        // the copy starts.
        let released = device.residency.vacate(&vacated);
        log::debug!("device {}: returned {} card pages", device.id, released);
        Ok(slots)
    }

    /// A host block of `order` for the page at `index`, held in `staging` until the
    /// migration commits or rolls back.
    fn allocate_host(
        &self,
        request: &MigrationRequest,
        index: usize,
        order: u32,
        staging: &mut Staging,
    ) -> Result<FrameNumber> {
        let host = self.device.host.as_ref();
        let Some(block) = host.allocate_pages(request.pid, request.page_address(index), order)
        else {
            log::error!(
                "device {}: no host memory for {} ({} blocks staged)",
                self.device.id,
                request.page_address(index),
                staging.host_blocks.len()
            );
            return Err(MigrateError::OutOfMemory);
        };
        staging.host_blocks.push((block, order));
        if order > 0 {
            host.get_page(block);
        }
        Ok(block)
    }

    /// Releases every staged destination in reverse order and aborts the staged
    /// migration.
    fn roll_back(&self, request: &MigrationRequest, mut staged: StagedMigration, staging: Staging) {
        let device = self.device;
        let host = device.host.as_ref();
        log::error!(
            "device {}: rolling back migration of [{}, {})",
            device.id,
            request.start,
            request.end()
        );

        for &pfn in staging.device_pages.iter().rev() {
            host.unlock_page(pfn);
            host.put_page(pfn);
            device.pages.free(pfn);
        }
        for &frame in staging.host_locked.iter().rev() {
            host.unlock_page(frame);
        }
        for &(block, order) in staging.host_blocks.iter().rev() {
            if order > 0 {
                host.put_page(block);
            }
            host.free_pages(block, order);
        }
        for destination in staged.dst.iter_mut() {
            *destination = None;
        }
        host.abort_staged(staged);
    }

    /// Copies the data of every moving page whose two ends are known. A granule
    /// whose two ends are both whole huge blocks goes as one huge copy.
    fn copy(&self, request: &MigrationRequest, slots: &[Slot], direction: Direction) {
        let device = self.device;
        let granule = device.config.granule_pages(request.huge) as usize;
        let huge_size = device.config.huge_tlb.page_size();
        let (mut block_host, mut block_card) = (Vec::new(), Vec::new());
        let (mut page_host, mut page_card) = (Vec::new(), Vec::new());

        for granule_slots in slots.chunks(granule) {
            if request.huge {
                let ends = || granule_slots.iter().map(Slot::copy_ends);
                let host = block_base(
                    ends().map(|pair| pair.map(|(host, _)| host.as_u64())),
                    huge_size,
                );
                let card = block_base(
                    ends().map(|pair| pair.map(|(_, card)| card.as_u64())),
                    huge_size,
                );
                if let (Some(host), Some(card)) = (host, card) {
                    block_host.push(PhysicalAddress::new(host));
                    block_card.push(CardAddress::new(card));
                    continue;
                }
            }
            for (host, card) in granule_slots.iter().filter_map(Slot::copy_ends) {
                page_host.push(host);
                page_card.push(card);
            }
        }

        self.submit(direction, &block_host, &block_card, true);
        self.submit(direction, &page_host, &page_card, false);
    }

    fn submit(
        &self,
        direction: Direction,
        host: &[PhysicalAddress],
        card: &[CardAddress],
        huge: bool,
    ) {
        if host.is_empty() {
            return;
        }
        let device = self.device;
        let dma = DmaRequest { host, card, huge };
        match direction {
            Direction::Card => device.offload_dma.copy(
                DmaClass::Offload,
                device.dma.as_ref(),
                device.scheduler.as_ref(),
                &dma,
            ),
            Direction::Host => device.sync_dma.copy(
                DmaClass::Sync,
                device.dma.as_ref(),
                device.scheduler.as_ref(),
                &dma,
            ),
        }
    }

    /// Where each page is mapped once the migration has committed.
    fn targets(
        &self,
        request: &MigrationRequest,
        staged: &StagedMigration,
        slots: &[Slot],
        direction: Direction,
    ) -> Vec<Option<TlbTarget>> {
        slots
            .iter()
            .enumerate()
            .map(|(index, slot)| match *slot {
                Slot::Absent => None,
                Slot::Resolved(target) => Some(target),
                Slot::Move { host, card } => {
                    if !staged.moved(index) {
                        if direction == Direction::Host {
                            log::error!(
                                "device {}: host refused to take back {}",
                                self.device.id,
                                request.page_address(index)
                            );
                        } else {
                            log::warn!(
                                "device {}: host refused to move {}",
                                self.device.id,
                                request.page_address(index)
                            );
                        }
                        return None;
                    }
                    match direction {
                        Direction::Host => host.map(TlbTarget::Host),
                        Direction::Card => card.map(TlbTarget::Card),
                    }
                }
            })
            .collect()
    }
}

impl Device {
    /// Moves a range to card memory and maps it for the accelerator.
    pub fn migrate_to_device(&self, request: &MigrationRequest) -> Result<()> {
        MigrationCoordinator::new(self).run(request, Direction::Card)
    }

    /// Moves a range back to host memory and maps it for the accelerator.
    pub fn migrate_to_host(&self, request: &MigrationRequest) -> Result<()> {
        MigrationCoordinator::new(self).run(request, Direction::Host)
    }

    /// Installs `targets`, one per regular page from `start`, and returns the number
    /// of entries written.
    ///
    /// With `huge` set, a granule whose pages fill one huge block in order gets a
    /// single huge entry and any other granule is mapped page by page. Must be called
    /// with the migration lock held.
    pub(crate) fn remap(
        &self,
        ctid: ContextId,
        pid: ProcessId,
        start: VirtualAddress,
        huge: bool,
        targets: &[Option<TlbTarget>],
    ) -> usize {
        if !huge {
            return self.tlb.install(ctid, pid, start, targets, false);
        }
        let granule = self.config.granule_pages(true) as usize;
        let huge_size = self.config.huge_tlb.page_size();
        let mut entries = Vec::with_capacity(targets.len() / granule);
        let mut mapped = 0;
        for (i, pages) in targets.chunks(granule).enumerate() {
            if pages.iter().all(Option::is_none) {
                entries.push(None);
                continue;
            }
            match huge_target(pages, huge_size) {
                Some(target) => entries.push(Some(target)),
                None => {
                    let base = start + i as u64 * huge_size;
                    log::debug!(
                        "device {}: huge page at {} is split, mapping it page by page",
                        self.id,
                        base
                    );
                    entries.push(None);
                    mapped += self.tlb.install(ctid, pid, base, pages, false);
                }
            }
        }
        mapped + self.tlb.install(ctid, pid, start, &entries, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::{Emulation, Residence};
    use crate::{DeviceConfig, DeviceId, DeviceServices, InvalidateRequest, TlbEntry, TlbPort};
    use std::thread;
    use std::time::Duration;

    const CTX: ContextId = ContextId(3);
    const PID: ProcessId = ProcessId(50);
    const BASE: u64 = 0x4000_0000;

    fn request(emulation: &Emulation, start: u64, npages: u64, huge: bool) -> MigrationRequest {
        MigrationRequest {
            ctid: CTX,
            pid: PID,
            start: VirtualAddress::new(start),
            npages,
            huge,
            vma: emulation.host.vma_of(PID, VirtualAddress::new(start)).unwrap(),
        }
    }

    fn setup(config: DeviceConfig, pages: u64) -> (Emulation, Arc<Device>) {
        let emulation = Emulation::new();
        emulation
            .host
            .add_vma(PID, VirtualAddress::new(BASE), pages, false);
        let device = emulation.device_with(DeviceId(0), config);
        device.register_context(CTX, PID);
        device.register_process(PID).unwrap();
        (emulation, device)
    }

    /// A huge area of one huge page at `BASE`, fully populated.
    fn setup_huge() -> (Emulation, Arc<Device>) {
        let emulation = Emulation::new();
        let per_huge = DeviceConfig::default().pages_per_huge();
        emulation
            .host
            .add_vma(PID, VirtualAddress::new(BASE), per_huge, true);
        emulation.host.populate(PID, VirtualAddress::new(BASE), per_huge);
        let device = emulation.device(DeviceId(0));
        device.register_context(CTX, PID);
        device.register_process(PID).unwrap();
        (emulation, device)
    }

    fn page(index: u64) -> VirtualAddress {
        VirtualAddress::new(BASE + index * PAGE_SIZE)
    }

    /// Where the accelerator would send an access to `addr`.
    fn translate(device: &Device, addr: VirtualAddress) -> Option<TlbTarget> {
        let (entry, huge) = device.tlb.lookup(PID, addr)?;
        let offset = if huge {
            addr.as_u64() % device.config.huge_tlb.page_size()
        } else {
            0
        };
        Some(match entry.target {
            TlbTarget::Host(base) => TlbTarget::Host(PhysicalAddress::new(base.as_u64() + offset)),
            TlbTarget::Card(base) => TlbTarget::Card(CardAddress::new(base.as_u64() + offset)),
        })
    }

    /// Every page is resident in exactly one place and its translation, if any,
    /// points there.
    fn assert_consistent(emulation: &Emulation, device: &Device, npages: u64) {
        for index in 0..npages {
            let residence = emulation.host.residence(PID, page(index));
            let target = translate(device, page(index));
            match residence {
                Residence::Host(frame) => {
                    if let Some(target) = target {
                        assert_eq!(target, TlbTarget::Host(frame.start()));
                    }
                }
                Residence::Device(pfn) => {
                    let (_, resident) = device.residency.lookup(pfn).unwrap();
                    if let Some(target) = target {
                        assert_eq!(target, TlbTarget::Card(resident.card_address));
                    }
                }
                Residence::None => assert!(target.is_none()),
            }
        }
    }

    fn snapshot(
        emulation: &Emulation,
        device: &Device,
        npages: u64,
    ) -> Vec<(Residence, Option<TlbEntry>)> {
        (0..npages)
            .map(|index| {
                (
                    emulation.host.residence(PID, page(index)),
                    device.tlb.lookup(PID, page(index)).map(|(entry, _)| entry),
                )
            })
            .collect()
    }

    #[test]
    fn device_ward_four_pages() {
        let (emulation, device) = setup(DeviceConfig::default(), 4);
        emulation.host.populate(PID, page(0), 4);

        device
            .migrate_to_device(&request(&emulation, BASE, 4, false))
            .unwrap();

        assert_eq!(device.residency.pages_of(CTX).len(), 4);
        for index in 0..4 {
            let Residence::Device(pfn) = emulation.host.residence(PID, page(index)) else {
                panic!("page {index} is not on the device");
            };
            let (ctid, resident) = device.residency.lookup(pfn).unwrap();
            assert_eq!(ctid, CTX);
            let (entry, huge) = device.tlb.lookup(PID, page(index)).unwrap();
            assert!(!huge);
            assert_eq!(entry.target, TlbTarget::Card(resident.card_address));
            assert_eq!(entry.ctid, CTX);
        }

        let copies = emulation.dma.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].class, DmaClass::Offload);
        assert_eq!(copies[0].host.len(), 4);

        let invalidations = emulation.tlb.invalidations();
        assert_eq!(invalidations.len(), 4);
        assert!(invalidations[3].last);
        assert_consistent(&emulation, &device, 4);
    }

    #[test]
    fn host_ward_with_partially_ineligible_range() {
        let (emulation, device) = setup(DeviceConfig::default(), 2);
        emulation.host.populate(PID, page(0), 2);
        device
            .migrate_to_device(&request(&emulation, BASE + PAGE_SIZE, 1, false))
            .unwrap();
        let Residence::Device(pfn) = emulation.host.residence(PID, page(1)) else {
            panic!("page 1 should be on the device");
        };
        let (_, resident) = device.residency.lookup(pfn).unwrap();
        let Residence::Host(frame0) = emulation.host.residence(PID, page(0)) else {
            panic!("page 0 should be on the host");
        };
        emulation.dma.clear();

        device
            .migrate_to_host(&request(&emulation, BASE, 2, false))
            .unwrap();

        let copies = emulation.dma.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].class, DmaClass::Sync);
        assert_eq!(copies[0].card, alloc::vec![resident.card_address]);
        assert_eq!(emulation.card.release_count(resident.card_address), 1);
        assert!(device.residency.pages_of(CTX).is_empty());
        assert!(!device.pages.is_allocated(pfn));

        let (entry0, _) = device.tlb.lookup(PID, page(0)).unwrap();
        assert_eq!(entry0.target, TlbTarget::Host(frame0.start()));
        let (entry1, _) = device.tlb.lookup(PID, page(1)).unwrap();
        assert_eq!(entry1.target.direction(), Direction::Host);
        assert_consistent(&emulation, &device, 2);
    }

    #[test]
    fn allocator_exhaustion_rolls_back() {
        let config = DeviceConfig::default().chunk_size(2 * PAGE_SIZE);
        let (emulation, device) = setup(config, 3);
        emulation.host.populate(PID, page(0), 3);
        emulation.host.limit_chunks(1);

        let host_targets: Vec<Option<TlbTarget>> = (0..3)
            .map(|index| match emulation.host.residence(PID, page(index)) {
                Residence::Host(frame) => Some(TlbTarget::Host(frame.start())),
                _ => None,
            })
            .collect();
        device
            .tlb
            .install(CTX, PID, page(0), &host_targets, false);
        let before = snapshot(&emulation, &device, 3);

        assert_eq!(
            device.migrate_to_device(&request(&emulation, BASE, 3, false)),
            Err(MigrateError::OutOfMemory)
        );

        assert_eq!(snapshot(&emulation, &device, 3), before);
        assert_eq!(device.pages.allocated_pages(), 0);
        assert_eq!(device.pages.free_pages(), 2);
        assert_eq!(emulation.host.locked_pages(), 0);
        assert_eq!(emulation.host.staged_migrations(), 0);
        assert!(device.residency.pages_of(CTX).is_empty());
        assert!(emulation.dma.copies().is_empty());
    }

    #[test]
    fn card_exhaustion_rolls_back() {
        let (emulation, device) = setup(DeviceConfig::default(), 4);
        emulation.host.populate(PID, page(0), 4);
        emulation.card.set_capacity_pages(2);
        let before = snapshot(&emulation, &device, 4);

        assert_eq!(
            device.migrate_to_device(&request(&emulation, BASE, 4, false)),
            Err(MigrateError::OutOfMemory)
        );
        assert_eq!(snapshot(&emulation, &device, 4), before);
        assert_eq!(device.pages.allocated_pages(), 0);
        assert_eq!(emulation.card.outstanding(), 0);
    }

    #[test]
    fn host_memory_exhaustion_restores_device_residency() {
        let (emulation, device) = setup(DeviceConfig::default(), 2);
        emulation.host.populate(PID, page(0), 2);
        device
            .migrate_to_device(&request(&emulation, BASE, 2, false))
            .unwrap();
        let before = snapshot(&emulation, &device, 2);
        let resident = device.residency.pages_of(CTX);

        emulation.host.limit_host_frames(0);
        assert_eq!(
            device.migrate_to_host(&request(&emulation, BASE, 2, false)),
            Err(MigrateError::OutOfMemory)
        );

        assert_eq!(snapshot(&emulation, &device, 2), before);
        assert_eq!(device.residency.pages_of(CTX), resident);
        for page in &resident {
            assert_eq!(emulation.card.release_count(page.card_address), 0);
        }
    }

    #[test]
    fn refused_pages_are_not_mapped() {
        let (emulation, device) = setup(DeviceConfig::default(), 3);
        emulation.host.populate(PID, page(0), 3);
        emulation.host.refuse_commit(PID, page(1));

        device
            .migrate_to_device(&request(&emulation, BASE, 3, false))
            .unwrap();

        assert!(matches!(emulation.host.residence(PID, page(1)), Residence::Host(_)));
        assert!(device.tlb.lookup(PID, page(1)).is_none());
        assert_eq!(device.residency.pages_of(CTX).len(), 2);
        assert_eq!(device.pages.allocated_pages(), 2);
        assert_eq!(emulation.card.outstanding(), 2);
        assert_consistent(&emulation, &device, 3);
    }

    #[test]
    fn unpopulated_pages_move_without_copy() {
        let (emulation, device) = setup(DeviceConfig::default(), 2);
        emulation.host.populate(PID, page(0), 1);

        device
            .migrate_to_device(&request(&emulation, BASE, 2, false))
            .unwrap();

        assert_eq!(emulation.dma.copies()[0].host.len(), 1);
        assert_eq!(device.residency.pages_of(CTX).len(), 2);
        assert_consistent(&emulation, &device, 2);
    }

    #[test]
    fn already_resident_pages_are_remapped() {
        let (emulation, device) = setup(DeviceConfig::default(), 2);
        emulation.host.populate(PID, page(0), 2);
        device
            .migrate_to_device(&request(&emulation, BASE, 1, false))
            .unwrap();
        emulation.dma.clear();

        device
            .migrate_to_device(&request(&emulation, BASE, 2, false))
            .unwrap();

        assert_eq!(emulation.dma.copies()[0].host.len(), 1);
        assert_eq!(device.residency.pages_of(CTX).len(), 2);
        assert!(device.tlb.lookup(PID, page(0)).is_some());
        assert_consistent(&emulation, &device, 2);
    }

    #[test]
    fn round_trip_leaves_no_device_state() {
        let (emulation, device) = setup(DeviceConfig::default(), 4);
        emulation.host.populate(PID, page(0), 4);

        device
            .migrate_to_device(&request(&emulation, BASE, 4, false))
            .unwrap();
        device
            .migrate_to_host(&request(&emulation, BASE, 4, false))
            .unwrap();

        assert_eq!(device.residency.resident_pages(), 0);
        assert_eq!(device.pages.allocated_pages(), 0);
        assert_eq!(device.pages.free_pages(), device.pages.total_pages());
        assert_eq!(emulation.card.outstanding(), 0);
        assert_eq!(emulation.host.locked_pages(), 0);
        assert_consistent(&emulation, &device, 4);
    }

    #[test]
    fn huge_round_trip() {
        let config = DeviceConfig::default();
        let per_huge = config.pages_per_huge();
        let huge_base = BASE;
        let emulation = Emulation::new();
        emulation
            .host
            .add_vma(PID, VirtualAddress::new(huge_base), per_huge, true);
        emulation.host.populate(PID, VirtualAddress::new(huge_base), per_huge);
        let device = emulation.device_with(DeviceId(0), config);
        device.register_context(CTX, PID);

        device
            .migrate_to_device(&request(&emulation, huge_base, per_huge, true))
            .unwrap();

        let copies = emulation.dma.copies();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].huge);
        assert_eq!(copies[0].host.len(), 1);
        let (entry, huge) = device
            .tlb
            .lookup(PID, VirtualAddress::new(huge_base + 7 * PAGE_SIZE))
            .unwrap();
        assert!(huge);
        assert_eq!(entry.target, TlbTarget::Card(copies[0].card[0]));
        assert_eq!(device.residency.resident_pages() as u64, per_huge);
        assert_eq!(emulation.card.outstanding(), 1);

        device
            .migrate_to_host(&request(&emulation, huge_base, per_huge, true))
            .unwrap();
        assert_eq!(emulation.card.outstanding(), 0);
        let (entry, huge) = device.tlb.lookup(PID, VirtualAddress::new(huge_base)).unwrap();
        assert!(huge);
        assert_eq!(entry.target.direction(), Direction::Host);
        assert_eq!(emulation.host.locked_pages(), 0);
    }

    #[test]
    fn rejects_malformed_requests() {
        let (emulation, device) = setup(DeviceConfig::default(), 4);
        let mut bad = request(&emulation, BASE, 4, false);
        bad.npages = 0;
        assert_eq!(device.migrate_to_device(&bad), Err(MigrateError::InvalidArgument));

        let mut outside = request(&emulation, BASE, 4, false);
        outside.npages = 8;
        assert_eq!(device.migrate_to_device(&outside), Err(MigrateError::InvalidRange));

        let mut unaligned = request(&emulation, BASE, 4, false);
        unaligned.huge = true;
        assert_eq!(device.migrate_to_device(&unaligned), Err(MigrateError::InvalidArgument));
        assert_eq!(emulation.host.staged_migrations(), 0);
    }

    #[test]
    fn invalidation_during_copy_skips_remap() {
        let (emulation, device) = setup(DeviceConfig::default(), 2);
        emulation.host.populate(PID, page(0), 2);
        let notifier = device.notifier(PID).unwrap();
        emulation.dma.on_copy(move || {
            let range = crate::InvalidationRange {
                start: page(0),
                end: page(2),
                event: crate::InvalidationEvent::Unmap,
                owner: None,
                blockable: true,
            };
            crate::InvalidationNotifier::invalidate(notifier.as_ref(), &range, 77).unwrap();
        });

        device
            .migrate_to_device(&request(&emulation, BASE, 2, false))
            .unwrap();

        assert!(device.tlb.is_empty());
        assert_eq!(device.residency.pages_of(CTX).len(), 2);
    }

    #[test]
    fn concurrent_invalidations_leave_state_consistent() {
        let (emulation, device) = setup(DeviceConfig::default(), 8);
        emulation.host.populate(PID, page(0), 8);
        let notifier = device.notifier(PID).unwrap();

        let invalidator = thread::spawn(move || {
            for seq in 1..200u64 {
                let range = crate::InvalidationRange {
                    start: page(0),
                    end: page(8),
                    event: crate::InvalidationEvent::Unmap,
                    owner: None,
                    blockable: seq % 2 == 0,
                };
                let _ = crate::InvalidationNotifier::invalidate(notifier.as_ref(), &range, seq);
                thread::yield_now();
            }
        });

        for _ in 0..20 {
            device
                .migrate_to_device(&request(&emulation, BASE, 8, false))
                .unwrap();
            device
                .migrate_to_host(&request(&emulation, BASE, 8, false))
                .unwrap();
        }
        invalidator.join().unwrap();

        assert_eq!(emulation.host.staged_migrations(), 0);
        assert_eq!(emulation.host.locked_pages(), 0);
        assert_eq!(device.residency.resident_pages(), 0);
        assert_eq!(emulation.card.outstanding(), 0);
        assert_consistent(&emulation, &device, 8);
    }

    #[test]
    fn migration_longer_than_mapping_limit() {
        let (emulation, device) = setup(DeviceConfig::default().max_map_pages(4), 6);
        emulation.host.populate(PID, page(0), 6);

        device
            .migrate_to_device(&request(&emulation, BASE, 6, false))
            .unwrap();

        for index in 0..6 {
            assert!(matches!(emulation.host.residence(PID, page(index)), Residence::Device(_)));
        }
        assert_eq!(device.tlb.len(), 4);
        assert!(device.tlb.lookup(PID, page(5)).is_none());
        assert_consistent(&emulation, &device, 6);
    }

    #[test]
    fn huge_granule_with_resident_head_moves_page_by_page() {
        let (emulation, device) = setup_huge();
        let per_huge = device.config.pages_per_huge();
        device
            .migrate_to_device(&request(&emulation, BASE, 1, false))
            .unwrap();
        emulation.dma.clear();

        device
            .migrate_to_device(&request(&emulation, BASE, per_huge, true))
            .unwrap();

        let copies = emulation.dma.copies();
        assert_eq!(copies.len(), 1);
        assert!(!copies[0].huge);
        assert_eq!(copies[0].host.len() as u64, per_huge - 1);
        assert_eq!(device.residency.resident_pages() as u64, per_huge);
        assert!(device.residency.pages_of(CTX).iter().all(|page| !page.huge));
        assert_eq!(emulation.card.outstanding() as u64, per_huge);
        for index in [0, 1, 7, per_huge - 1] {
            assert!(translate(&device, page(index)).is_some());
        }
        assert_consistent(&emulation, &device, per_huge);

        assert_eq!(device.free_card_memory(CTX) as u64, per_huge);
        assert_eq!(emulation.card.outstanding(), 0);
    }

    #[test]
    fn split_huge_granule_returns_as_one_huge_page() {
        let (emulation, device) = setup_huge();
        let per_huge = device.config.pages_per_huge();
        device
            .migrate_to_device(&request(&emulation, BASE, 1, false))
            .unwrap();
        device
            .migrate_to_device(&request(&emulation, BASE, per_huge, true))
            .unwrap();

        device
            .migrate_to_host(&request(&emulation, BASE, per_huge, true))
            .unwrap();

        assert_eq!(emulation.card.outstanding(), 0);
        assert_eq!(device.residency.resident_pages(), 0);
        assert_eq!(emulation.host.locked_pages(), 0);
        let (entry, huge) = device.tlb.lookup(PID, page(7)).unwrap();
        assert!(huge);
        assert_eq!(entry.target.direction(), Direction::Host);
        assert_consistent(&emulation, &device, per_huge);
    }

    #[test]
    fn refused_sub_page_splits_huge_mapping() {
        let (emulation, device) = setup_huge();
        let per_huge = device.config.pages_per_huge();
        emulation.host.refuse_commit(PID, page(3));

        device
            .migrate_to_device(&request(&emulation, BASE, per_huge, true))
            .unwrap();

        let copies = emulation.dma.copies();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].huge);
        let block = copies[0].card[0];
        assert!(matches!(emulation.host.residence(PID, page(3)), Residence::Host(_)));
        assert!(device.tlb.lookup(PID, page(3)).is_none());
        let (entry, huge) = device.tlb.lookup(PID, page(7)).unwrap();
        assert!(!huge);
        assert_eq!(entry.target, TlbTarget::Card(block + 7 * PAGE_SIZE));
        assert_eq!(emulation.card.outstanding(), 1);
        assert_consistent(&emulation, &device, per_huge);

        assert_eq!(device.free_card_memory(CTX) as u64, per_huge - 1);
        assert_eq!(emulation.card.release_count(block), 1);
        assert_eq!(emulation.card.outstanding(), 0);
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PortEvent {
        Write { valid: bool },
        Invalidate,
        Acknowledge,
    }

    /// Acknowledges every invalidation batch from another thread, a while after the
    /// batch was issued.
    #[derive(Default)]
    struct LateAckPort {
        events: Arc<spin::Mutex<Vec<PortEvent>>>,
    }

    impl TlbPort for LateAckPort {
        fn write_entry(&self, huge: bool, words: [u64; 2]) {
            let valid = DeviceConfig::default().tlb(huge).is_valid(words);
            self.events.lock().push(PortEvent::Write { valid });
        }

        fn invalidate(&self, request: &InvalidateRequest, done: &Arc<Completion>) {
            self.events.lock().push(PortEvent::Invalidate);
            if request.last {
                let events = self.events.clone();
                let done = done.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    events.lock().push(PortEvent::Acknowledge);
                    done.signal();
                });
            }
        }
    }

    #[test]
    fn rollback_restores_translations_after_acknowledgement() {
        let emulation = Emulation::new();
        emulation
            .host
            .add_vma(PID, VirtualAddress::new(BASE), 2, false);
        emulation.host.populate(PID, page(0), 2);
        let port = Arc::new(LateAckPort::default());
        let services = DeviceServices {
            tlb: port.clone(),
            ..emulation.services()
        };
        let device = Device::new(DeviceId(0), DeviceConfig::default(), services).unwrap();
        device.register_context(CTX, PID);
        device.register_process(PID).unwrap();

        let host_targets: Vec<Option<TlbTarget>> = (0..2)
            .map(|index| match emulation.host.residence(PID, page(index)) {
                Residence::Host(frame) => Some(TlbTarget::Host(frame.start())),
                _ => None,
            })
            .collect();
        device
            .tlb
            .install(CTX, PID, page(0), &host_targets, false);
        emulation.card.set_capacity_pages(1);
        let before = snapshot(&emulation, &device, 2);

        assert_eq!(
            device.migrate_to_device(&request(&emulation, BASE, 2, false)),
            Err(MigrateError::OutOfMemory)
        );
        assert_eq!(snapshot(&emulation, &device, 2), before);

        let events = port.events.lock().clone();
        let acknowledged = events
            .iter()
            .position(|event| *event == PortEvent::Acknowledge)
            .unwrap();
        let restored: Vec<usize> = events
            .iter()
            .enumerate()
            .skip(2)
            .filter(|(_, event)| **event == PortEvent::Write { valid: true })
            .map(|(index, _)| index)
            .collect();
        assert_eq!(restored.len(), 2);
        assert!(restored.iter().all(|&index| index > acknowledged));
    }
}
