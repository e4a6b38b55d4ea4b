//! Accelerator TLB management.
//!
//! The accelerator translates virtual addresses through two set-associative TLBs, one
//! for regular pages and one for huge pages. The driver cannot read them back, so
//! [`TlbMappingManager`] keeps a shadow copy of every entry it writes: that copy is
//! what the rest of the core reasons about, and what rollback restores from.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::ops::RangeBounds;

use spin::Mutex;

use crate::{
    CardAddress, Completion, ContextId, DeviceConfig, Direction, PAGE_SHIFT, PAGE_SIZE,
    PageNumber, PhysicalAddress, ProcessId, TLB_CTID_BITS, TLB_STRM_BITS, TlbGeometry,
    VirtualAddress,
};

/// What a TLB entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbTarget {
    Host(PhysicalAddress),
    Card(CardAddress),
}

impl TlbTarget {
    pub const fn direction(&self) -> Direction {
        match self {
            TlbTarget::Host(_) => Direction::Host,
            TlbTarget::Card(_) => Direction::Card,
        }
    }

    pub(crate) const fn raw(&self) -> u64 {
        match self {
            TlbTarget::Host(addr) => addr.as_u64(),
            TlbTarget::Card(addr) => addr.as_u64(),
        }
    }
}

/// A live translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub target: TlbTarget,
    pub ctid: ContextId,
}

/// An entry taken down by [`TlbMappingManager::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedEntry {
    pub page: PageNumber,
    pub huge: bool,
    pub entry: TlbEntry,
}

/// One invalidation command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidateRequest {
    pub vaddr: VirtualAddress,
    /// Regular pages covered by this command.
    pub pages: u64,
    pub pid: ProcessId,
    /// Set on the final command of a batch; the accelerator acknowledges it.
    pub last: bool,
}

/// The accelerator's TLB register interface.
pub trait TlbPort: Send + Sync {
    /// Writes one encoded entry into the regular or huge TLB.
    fn write_entry(&self, huge: bool, words: [u64; 2]);

    /// Issues an invalidation command. When `request.last` is set the port raises
    /// `done` once the accelerator has acknowledged the batch.
    fn invalidate(&self, request: &InvalidateRequest, done: &Arc<Completion>);
}

impl TlbGeometry {
    fn key_and_tag(&self, page: PageNumber) -> (u64, u64) {
        let vpn = page.as_u64() >> (self.page_shift - PAGE_SHIFT);
        let key = vpn & self.key_mask();
        let tag = (vpn >> self.key_size) & self.tag_mask();
        (key, tag)
    }

    /// Encodes a valid entry translating `page` to `target`.
    pub fn encode_mapping(
        &self,
        page: PageNumber,
        target: TlbTarget,
        ctid: ContextId,
        pid: ProcessId,
    ) -> [u64; 2] {
        let (key, tag) = self.key_and_tag(page);
        let phys = (target.raw() >> self.page_shift) & self.phy_mask();
        let host = match target.direction() {
            Direction::Host => 1,
            Direction::Card => 0,
        };
        let ctid_shift = self.key_size + self.tag_size();
        let host_shift = ctid_shift + TLB_CTID_BITS;
        let valid_shift = host_shift + TLB_STRM_BITS;

        let word0 = phys | (u64::from(pid.0) << 32);
        let word1 = key
            | (tag << self.key_size)
            | ((u64::from(ctid.0) & ((1 << TLB_CTID_BITS) - 1)) << ctid_shift)
            | (host << host_shift)
            | (1 << valid_shift)
            | (phys << (valid_shift + 1));
        [word0, word1]
    }

    /// Encodes the invalid entry that clears `page`.
    pub fn encode_unmapping(&self, page: PageNumber, pid: ProcessId) -> [u64; 2] {
        let (key, tag) = self.key_and_tag(page);
        [u64::from(pid.0) << 32, key | (tag << self.key_size)]
    }

    /// Returns true if bit `valid` of an encoded entry is set.
    pub fn is_valid(&self, words: [u64; 2]) -> bool {
        let valid_shift = self.key_size + self.tag_size() + TLB_CTID_BITS + TLB_STRM_BITS;
        words[1] & (1 << valid_shift) != 0
    }
}

type Table = BTreeMap<(ProcessId, PageNumber), TlbEntry>;

#[derive(Default)]
struct Tables {
    regular: Table,
    huge: Table,
}

impl Tables {
    fn table(&mut self, huge: bool) -> &mut Table {
        if huge { &mut self.huge } else { &mut self.regular }
    }
}

/// Owns the accelerator-side translations of one device.
pub struct TlbMappingManager {
    config: DeviceConfig,
    port: Arc<dyn TlbPort>,
    tables: Mutex<Tables>,
}

impl TlbMappingManager {
    pub fn new(config: DeviceConfig, port: Arc<dyn TlbPort>) -> Self {
        Self {
            config,
            port,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Installs one entry per granule starting at `base`.
    ///
    /// Slot `i` maps the granule at `base + i * granule`; `None` slots are skipped,
    /// leaving that granule unmapped. Returns the number of entries written.
    pub fn install(
        &self,
        ctid: ContextId,
        pid: ProcessId,
        base: VirtualAddress,
        targets: &[Option<TlbTarget>],
        huge: bool,
    ) -> usize {
        let geometry = self.config.tlb(huge);
        let stride = self.config.granule_pages(huge);
        let first = base.page_number();

        if targets.len() > self.config.max_map_pages {
            log::warn!(
                "mapping {} granules at {} truncated to {}",
                targets.len(),
                base,
                self.config.max_map_pages
            );
        }

        let mut tables = self.tables.lock();
        let mut installed = 0;
        for (i, target) in targets.iter().take(self.config.max_map_pages).enumerate() {
            let Some(target) = *target else {
                continue;
            };
            let page = first + i as u64 * stride;
            log::trace!("tlb map {} -> {:?} ctid {} pid {} huge {}", page, target, ctid, pid, huge);
            self.port
                .write_entry(huge, geometry.encode_mapping(page, target, ctid, pid));
            tables.table(huge).insert((pid, page), TlbEntry { target, ctid });
            installed += 1;
        }
        installed
    }

    /// Removes every translation of `pid` overlapping `granules` granules at `base`
    /// and invalidates them on the accelerator.
    ///
    /// Always walks the whole range, so removing an unmapped range is a no-op apart
    /// from the invalidation commands. Translations of the other page size that overlap
    /// the range are removed as well. `done` is raised once the accelerator has
    /// acknowledged the invalidation.
    pub fn remove(
        &self,
        pid: ProcessId,
        base: VirtualAddress,
        granules: u64,
        huge: bool,
        done: &Arc<Completion>,
    ) -> Vec<RemovedEntry> {
        let stride = self.config.granule_pages(huge);
        let first = base.page_number();
        let end = first + granules * stride;
        let geometry = self.config.tlb(huge);

        let mut removed = Vec::new();
        {
            let mut tables = self.tables.lock();
            for i in 0..granules {
                let page = first + i * stride;
                self.port
                    .write_entry(huge, geometry.encode_unmapping(page, pid));
                if let Some(entry) = tables.table(huge).remove(&(pid, page)) {
                    log::trace!("tlb unmap {} pid {} huge {}", page, pid, huge);
                    removed.push(RemovedEntry { page, huge, entry });
                }
            }

            // Entries of the other size that overlap the range.
            let other = !huge;
            let other_span = self.config.granule_pages(other);
            let low = PageNumber::new(first.as_u64().saturating_sub(other_span - 1));
            let overlapping = self.take(&mut tables, other, (pid, low)..(pid, end), |page, _| {
                page + other_span > first
            });
            removed.extend(overlapping.into_iter().map(|(_, entry)| entry));
        }

        self.invalidate(base, granules, pid, huge, done);
        removed
    }

    /// Issues one invalidation command per granule; the final one carries `last`.
    pub fn invalidate(
        &self,
        base: VirtualAddress,
        granules: u64,
        pid: ProcessId,
        huge: bool,
        done: &Arc<Completion>,
    ) {
        if granules == 0 {
            done.signal();
            return;
        }
        let stride = self.config.granule_pages(huge);
        let first = base.page_number();
        for i in 0..granules {
            let request = InvalidateRequest {
                vaddr: (first + i * stride).start(),
                pages: stride,
                pid,
                last: i == granules - 1,
            };
            self.port.invalidate(&request, done);
        }
    }

    /// Reinstalls entries previously taken down by [`remove`](Self::remove).
    pub fn restore(&self, pid: ProcessId, removed: &[RemovedEntry]) {
        let mut tables = self.tables.lock();
        for removed in removed {
            let geometry = self.config.tlb(removed.huge);
            let entry = removed.entry;
            self.port.write_entry(
                removed.huge,
                geometry.encode_mapping(removed.page, entry.target, entry.ctid, pid),
            );
            tables
                .table(removed.huge)
                .insert((pid, removed.page), removed.entry);
        }
        log::debug!("restored {} tlb entries for pid {}", removed.len(), pid);
    }

    /// Removes every translation of `pid` overlapping `[start, end)`, whatever its
    /// page size, and invalidates each of them. Returns the number removed.
    ///
    /// Only entries present in the shadow tables are visited, so the cost does not
    /// depend on the size of the range.
    pub fn remove_range(
        &self,
        pid: ProcessId,
        start: VirtualAddress,
        end: VirtualAddress,
        done: &Arc<Completion>,
    ) -> usize {
        let first = start.page_number();
        let last = end.align_up(PAGE_SIZE).page_number();
        if last <= first {
            done.signal();
            return 0;
        }
        let taken = {
            let mut tables = self.tables.lock();
            let mut taken = Vec::new();
            for huge in [false, true] {
                let span = self.config.granule_pages(huge);
                let low = PageNumber::new(first.as_u64().saturating_sub(span - 1));
                taken.extend(self.take(
                    &mut tables,
                    huge,
                    (pid, low)..=(pid, last - 1),
                    |page, _| page + span > first,
                ));
            }
            taken
        };
        self.invalidate_taken(&taken, done);
        taken.len()
    }

    /// Removes every translation of `pid`.
    pub fn remove_process(&self, pid: ProcessId, done: &Arc<Completion>) -> usize {
        let taken = {
            let mut tables = self.tables.lock();
            let mut taken = Vec::new();
            for huge in [false, true] {
                taken.extend(self.take(
                    &mut tables,
                    huge,
                    (pid, PageNumber::new(0))..=(pid, PageNumber::new(u64::MAX)),
                    |_, _| true,
                ));
            }
            taken
        };
        self.invalidate_taken(&taken, done);
        taken.len()
    }

    /// Removes every translation installed on behalf of `ctid`, in any process.
    pub fn remove_context(&self, ctid: ContextId, done: &Arc<Completion>) -> usize {
        let taken = {
            let mut tables = self.tables.lock();
            let mut taken = Vec::new();
            for huge in [false, true] {
                taken.extend(self.take(&mut tables, huge, .., |_, entry| entry.ctid == ctid));
            }
            taken
        };
        self.invalidate_taken(&taken, done);
        taken.len()
    }

    /// Takes the selected entries of one table out of the shadow copy and clears
    /// them on the accelerator.
    fn take(
        &self,
        tables: &mut Tables,
        huge: bool,
        keys: impl RangeBounds<(ProcessId, PageNumber)>,
        select: impl Fn(PageNumber, &TlbEntry) -> bool,
    ) -> Vec<(ProcessId, RemovedEntry)> {
        let table = tables.table(huge);
        let selected: Vec<(ProcessId, PageNumber)> = table
            .range(keys)
            .filter(|&(&(_, page), entry)| select(page, entry))
            .map(|(&key, _)| key)
            .collect();

        let geometry = self.config.tlb(huge);
        let mut taken = Vec::with_capacity(selected.len());
        for (pid, page) in selected {
            if let Some(entry) = table.remove(&(pid, page)) {
                log::trace!("tlb unmap {} pid {} huge {}", page, pid, huge);
                self.port.write_entry(huge, geometry.encode_unmapping(page, pid));
                taken.push((pid, RemovedEntry { page, huge, entry }));
            }
        }
        taken
    }

    /// One invalidation command per taken entry; `done` is raised right away when
    /// nothing was taken.
    fn invalidate_taken(&self, taken: &[(ProcessId, RemovedEntry)], done: &Arc<Completion>) {
        let Some(final_index) = taken.len().checked_sub(1) else {
            done.signal();
            return;
        };
        for (i, (pid, removed)) in taken.iter().enumerate() {
            let request = InvalidateRequest {
                vaddr: removed.page.start(),
                pages: self.config.granule_pages(removed.huge),
                pid: *pid,
                last: i == final_index,
            };
            self.port.invalidate(&request, done);
        }
    }

    /// Returns the translation covering `addr`, and whether it is a huge one.
    pub fn lookup(&self, pid: ProcessId, addr: VirtualAddress) -> Option<(TlbEntry, bool)> {
        let tables = self.tables.lock();
        let page = addr.page_number();
        if let Some(entry) = tables.regular.get(&(pid, page)) {
            return Some((*entry, false));
        }
        let head = addr
            .align_down(self.config.huge_tlb.page_size())
            .page_number();
        tables.huge.get(&(pid, head)).map(|entry| (*entry, true))
    }

    pub fn len(&self) -> usize {
        let tables = self.tables.lock();
        tables.regular.len() + tables.huge.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
