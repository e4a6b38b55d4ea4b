//! Per-process invalidation endpoint.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    Completion, Device, InvalidationEvent, InvalidationNotifier, InvalidationRange, MigrateError,
    ProcessId, Result, TLB_VADDR_BITS, VirtualAddress,
};

/// First address the accelerator cannot translate.
const MAPPABLE_LIMIT: VirtualAddress = VirtualAddress::new(1 << TLB_VADDR_BITS);

/// Registered with the host for every process that uses the device. It only ever
/// tears accelerator translations down; it never moves data.
pub struct AddressSpaceNotifier {
    pid: ProcessId,
    device: Weak<Device>,
    seq: AtomicU64,
}

impl AddressSpaceNotifier {
    pub(crate) fn new(pid: ProcessId, device: Weak<Device>) -> Self {
        Self {
            pid,
            device,
            seq: AtomicU64::new(0),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Samples the sequence number before a read of the host's page tables.
    pub fn read_begin(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Returns true if an invalidation was delivered since `seq` was sampled.
    pub fn is_stale(&self, seq: u64) -> bool {
        self.seq.load(Ordering::Acquire) != seq
    }
}

impl InvalidationNotifier for AddressSpaceNotifier {
    fn invalidate(&self, range: &InvalidationRange, cur_seq: u64) -> Result<()> {
        let Some(device) = self.device.upgrade() else {
            return Ok(());
        };

        if range.event == InvalidationEvent::Migrate && range.owner == Some(device.id()) {
            log::trace!(
                "pid {}: ignoring invalidation of [{}, {}) raised by our own migration",
                self.pid,
                range.start,
                range.end
            );
            return Ok(());
        }

        let guard = if range.blockable {
            device.migration_lock.lock()
        } else {
            match device.migration_lock.try_lock() {
                Some(guard) => guard,
                None => {
                    log::warn!(
                        "pid {}: migration lock contended, deferring invalidation of [{}, {})",
                        self.pid,
                        range.start,
                        range.end
                    );
                    return Err(MigrateError::Busy);
                }
            }
        };

        self.seq.store(cur_seq, Ordering::Release);

        // Hosts report whole-address-space ranges on teardown.
        let huge = device.host.is_huge_page(self.pid, range.start);
        let granule = device.config.tlb(huge).page_size();
        let start = range.start.min(MAPPABLE_LIMIT).align_down(granule);
        let end = range.end.min(MAPPABLE_LIMIT).align_up(granule);

        let done = Arc::new(Completion::new());
        let removed = device.tlb.remove_range(self.pid, start, end, &done);
        log::debug!(
            "pid {}: invalidated [{}, {}), {} translations removed (huge {})",
            self.pid,
            start,
            end,
            removed,
            huge
        );
        drop(guard);

        // Non-blocking callers cannot wait for the acknowledgement.
        if range.blockable {
            done.wait(device.scheduler.as_ref());
        }
        Ok(())
    }
}
