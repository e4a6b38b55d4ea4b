//! Fault dispatch: accelerator faults, host-side fault resolution, CPU faults on
//! card-resident pages and explicitly requested migrations.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    Completion, ContextId, Device, Direction, FrameNumber, HostError, Mapping, MigrateError,
    MigrationRequest, PAGE_SIZE, ProcessId, Result, TlbTarget, VirtualAddress,
};

/// What the accelerator wants when it faults on an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AccessKind {
    /// The data should move to card memory.
    CardAccess = 0,
    /// The data should be accessed in host memory.
    HostAccess = 1,
}

impl TryFrom<u32> for AccessKind {
    type Error = MigrateError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(AccessKind::CardAccess),
            1 => Ok(AccessKind::HostAccess),
            _ => Err(MigrateError::InvalidArgument),
        }
    }
}

impl AccessKind {
    pub const fn direction(self) -> Direction {
        match self {
            AccessKind::CardAccess => Direction::Card,
            AccessKind::HostAccess => Direction::Host,
        }
    }
}

/// Arguments of a migration requested through the control path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateArgs {
    pub ctid: ContextId,
    pub pid: ProcessId,
    pub vaddr: VirtualAddress,
    /// Length in regular pages.
    pub npages: u64,
}

impl Device {
    /// Builds a granule-aligned migration request covering `[vaddr, vaddr + len)`.
    fn build_request(
        &self,
        ctid: ContextId,
        pid: ProcessId,
        vaddr: VirtualAddress,
        len: u64,
    ) -> Result<MigrationRequest> {
        if len == 0 {
            return Err(MigrateError::InvalidArgument);
        }
        let Some(vma) = self.host.find_vma(pid, vaddr, vaddr + len) else {
            log::error!(
                "device {}: no area of pid {} intersects [{}, {})",
                self.id,
                pid,
                vaddr,
                vaddr + len
            );
            return Err(MigrateError::InvalidRange);
        };

        let huge = self.host.is_huge_page(pid, vaddr);
        let granule = self.config.tlb(huge).page_size();
        let start = vaddr.align_down(granule);
        let end = (vaddr + len).align_up(granule);
        Ok(MigrationRequest {
            ctid,
            pid,
            start,
            npages: (end - start) / PAGE_SIZE,
            huge,
            vma,
        })
    }

    /// Accelerator fault entry: migrates `[vaddr, vaddr + len)` towards the side the
    /// access needs and maps it.
    ///
    /// `access` is the raw access kind reported by the accelerator; unknown values
    /// are rejected with [`MigrateError::InvalidArgument`] before anything is locked.
    pub fn mmu_handler(
        &self,
        vaddr: VirtualAddress,
        len: u64,
        ctid: ContextId,
        access: u32,
        pid: ProcessId,
    ) -> Result<()> {
        let access = AccessKind::try_from(access).inspect_err(|_| {
            log::error!("device {}: unknown access kind {}", self.id, access);
        })?;
        log::debug!(
            "device {}: {:?} fault at {}+{:#x}, ctid {}, pid {}",
            self.id,
            access,
            vaddr,
            len,
            ctid,
            pid
        );

        let request = self.build_request(ctid, pid, vaddr, len)?;
        match access {
            AccessKind::HostAccess => self.migrate_to_host(&request),
            AccessKind::CardAccess => self.migrate_to_device(&request),
        }
    }

    /// Control path: moves a range to card memory.
    pub fn migrate_to_card(&self, args: &MigrateArgs) -> Result<()> {
        let request = self.build_request(args.ctid, args.pid, args.vaddr, args.npages * PAGE_SIZE)?;
        self.migrate_to_device(&request)
    }

    /// Control path: moves a range back to host memory.
    pub fn migrate_from_card(&self, args: &MigrateArgs) -> Result<()> {
        let request = self.build_request(args.ctid, args.pid, args.vaddr, args.npages * PAGE_SIZE)?;
        self.migrate_to_host(&request)
    }

    /// Has the host fault `[vaddr, vaddr + len)` in, then maps the range for the
    /// accelerator wherever it ended up.
    ///
    /// The host fault is retried while the host reports contention or while an
    /// invalidation races with it, until the configured timeout expires.
    pub fn service_host_fault(
        &self,
        ctid: ContextId,
        vaddr: VirtualAddress,
        len: u64,
        pid: ProcessId,
    ) -> Result<()> {
        let Some(notifier) = self.notifier(pid) else {
            log::error!("device {}: pid {} has no registered notifier", self.id, pid);
            return Err(MigrateError::InvalidArgument);
        };
        if len == 0 {
            return Err(MigrateError::InvalidArgument);
        }

        let huge = self.host.is_huge_page(pid, vaddr);
        let geometry = self.config.tlb(huge);
        let start = vaddr.align_down(geometry.page_size());
        let end = (vaddr + len).align_up(geometry.page_size());
        let npages = (end - start) / PAGE_SIZE;
        let granules = npages / self.config.granule_pages(huge);
        let deadline = self.scheduler.now_ms() + self.config.fault_timeout_ms;

        loop {
            if self.scheduler.now_ms() > deadline {
                log::error!(
                    "device {}: resolving [{}, {}) for pid {} timed out",
                    self.id,
                    start,
                    end,
                    pid
                );
                return Err(MigrateError::Timeout);
            }

            let seq = notifier.read_begin();
            let mappings = match self.host.resolve_fault(pid, start, npages, self.id) {
                Ok(mappings) => mappings,
                Err(HostError::EBUSY) => {
                    log::trace!("device {}: host fault at {} busy, retrying", self.id, start);
                    self.scheduler.yield_now();
                    continue;
                }
                Err(err) => {
                    log::error!("device {}: host fault at {} failed: {}", self.id, start, err);
                    return Err(err.into());
                }
            };

            let done = Arc::new(Completion::new());
            {
                let _guard = self.migration_lock.lock();
                if notifier.is_stale(seq) {
                    log::debug!(
                        "device {}: [{}, {}) invalidated while faulting, retrying",
                        self.id,
                        start,
                        end
                    );
                    continue;
                }

                let targets: Vec<Option<TlbTarget>> = mappings
                    .iter()
                    .map(|mapping| match *mapping {
                        Some(Mapping::Host(frame)) => Some(TlbTarget::Host(frame.start())),
                        Some(Mapping::DevicePrivate(pfn)) => self
                            .residency
                            .lookup(pfn)
                            .map(|(_, page)| TlbTarget::Card(page.card_address)),
                        None => None,
                    })
                    .collect();
                self.tlb.remove(pid, start, granules, huge, &done);
                let mapped = self.remap(ctid, pid, start, huge, &targets);
                log::debug!(
                    "device {}: host fault at {} resolved, {} translations over {} granules",
                    self.id,
                    start,
                    mapped,
                    granules
                );
            }
            done.wait(self.scheduler.as_ref());
            return Ok(());
        }
    }

    /// A CPU touched `addr`, backed by our device-private page `pfn`: bring the
    /// granule containing it back to host memory.
    pub(crate) fn cpu_fault(&self, addr: VirtualAddress, pfn: FrameNumber) -> Result<()> {
        let Some((ctid, page)) = self.residency.lookup(pfn) else {
            log::warn!("device {}: CPU fault on non-resident page {}", self.id, pfn);
            return Err(MigrateError::InvalidArgument);
        };
        let Some(pid) = self.process_of(ctid) else {
            log::warn!("device {}: CPU fault on page {} of unknown context {}", self.id, pfn, ctid);
            return Err(MigrateError::InvalidArgument);
        };

        let granule = self.config.tlb(page.huge).page_size();
        let start = addr.align_down(granule);
        let Some(vma) = self.host.find_vma(pid, start, start + granule) else {
            return Err(MigrateError::InvalidRange);
        };
        log::debug!(
            "device {}: CPU fault at {} on page {}, ctid {}, pid {}",
            self.id,
            addr,
            pfn,
            ctid,
            pid
        );
        self.migrate_to_host(&MigrationRequest {
            ctid,
            pid,
            start,
            npages: self.config.granule_pages(page.huge),
            huge: page.huge,
            vma,
        })
    }
}
