//! Per-device state and the management path.

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};

use spin::Mutex;

use crate::{
    AddressSpaceNotifier, CardMemoryAllocator, Completion, ContextId, DeviceConfig, DeviceId,
    DevicePagemapOps, DmaChannel, DmaEngine, FrameNumber, HostMemoryManager, MigrateError,
    NotifierHandle, PrivatePageAllocator, ProcessId, ResidencyRegistry, Result, Scheduler,
    TlbMappingManager, TlbPort, VirtualAddress,
};

/// External collaborators a device is built on.
#[derive(Clone)]
pub struct DeviceServices {
    pub host: Arc<dyn HostMemoryManager>,
    pub dma: Arc<dyn DmaEngine>,
    pub card: Arc<dyn CardMemoryAllocator>,
    pub tlb: Arc<dyn TlbPort>,
    pub scheduler: Arc<dyn Scheduler>,
}

struct Registration {
    notifier: Arc<AddressSpaceNotifier>,
    handle: NotifierHandle,
}

/// One accelerator and everything the migration core tracks for it.
///
/// Devices share nothing; every lock below is per device.
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) config: DeviceConfig,
    pub(crate) host: Arc<dyn HostMemoryManager>,
    pub(crate) dma: Arc<dyn DmaEngine>,
    pub(crate) card: Arc<dyn CardMemoryAllocator>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) tlb: TlbMappingManager,
    pub(crate) pages: PrivatePageAllocator,
    pub(crate) residency: ResidencyRegistry,
    /// Serializes TLB invalidation and remapping across migrations and notifiers.
    pub(crate) migration_lock: Mutex<()>,
    pub(crate) sync_dma: DmaChannel,
    pub(crate) offload_dma: DmaChannel,
    notifiers: Mutex<BTreeMap<ProcessId, Registration>>,
    contexts: Mutex<BTreeMap<ContextId, ProcessId>>,
}

/// Device-private page callbacks handed to the host with every chunk.
struct PagemapCallbacks {
    device: Weak<Device>,
}

impl DevicePagemapOps for PagemapCallbacks {
    fn page_free(&self, pfn: FrameNumber) {
        if let Some(device) = self.device.upgrade() {
            device.release_private_page(pfn);
        }
    }

    fn migrate_to_ram(&self, addr: VirtualAddress, pfn: FrameNumber) -> Result<()> {
        let device = self.device.upgrade().ok_or(MigrateError::InvalidArgument)?;
        device.cpu_fault(addr, pfn)
    }
}

impl Device {
    pub fn new(id: DeviceId, config: DeviceConfig, services: DeviceServices) -> Result<Arc<Self>> {
        config.validate()?;
        log::info!(
            "device {}: chunk size {:#x}, {} pages per huge page",
            id,
            config.chunk_size,
            config.pages_per_huge()
        );

        Ok(Arc::new_cyclic(|this: &Weak<Device>| {
            let ops: Arc<dyn DevicePagemapOps> = Arc::new(PagemapCallbacks {
                device: this.clone(),
            });
            Device {
                id,
                config,
                tlb: TlbMappingManager::new(config, services.tlb),
                pages: PrivatePageAllocator::new(id, config.chunk_size, services.host.clone(), ops),
                residency: ResidencyRegistry::new(
                    services.card.clone(),
                    config.huge_tlb.page_size(),
                ),
                host: services.host,
                dma: services.dma,
                card: services.card,
                scheduler: services.scheduler,
                migration_lock: Mutex::new(()),
                sync_dma: DmaChannel::new(),
                offload_dma: DmaChannel::new(),
                notifiers: Mutex::new(BTreeMap::new()),
                contexts: Mutex::new(BTreeMap::new()),
            }
        }))
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn tlb(&self) -> &TlbMappingManager {
        &self.tlb
    }

    pub fn private_pages(&self) -> &PrivatePageAllocator {
        &self.pages
    }

    pub fn residency(&self) -> &ResidencyRegistry {
        &self.residency
    }

    /// Binds a context to the host process it runs for.
    pub fn register_context(&self, ctid: ContextId, pid: ProcessId) {
        log::debug!("device {}: context {} -> pid {}", self.id, ctid, pid);
        self.contexts.lock().insert(ctid, pid);
    }

    /// Forgets a context, takes down its translations and reclaims the card memory
    /// it holds. Returns the number of card-resident pages released.
    pub fn unregister_context(&self, ctid: ContextId) -> usize {
        self.contexts.lock().remove(&ctid);

        let done = Arc::new(Completion::new());
        let removed = {
            let _guard = self.migration_lock.lock();
            self.tlb.remove_context(ctid, &done)
        };
        // The card memory may only be reused once the accelerator stopped using it.
        done.wait(self.scheduler.as_ref());
        log::debug!(
            "device {}: unregistered context {}, removed {} translations",
            self.id,
            ctid,
            removed
        );
        self.free_card_memory(ctid)
    }

    pub fn process_of(&self, ctid: ContextId) -> Option<ProcessId> {
        self.contexts.lock().get(&ctid).copied()
    }

    /// Registers an invalidation notifier for `pid` with the host. Registering a
    /// process twice is a no-op.
    pub fn register_process(self: &Arc<Self>, pid: ProcessId) -> Result<()> {
        let mut notifiers = self.notifiers.lock();
        if notifiers.contains_key(&pid) {
            return Ok(());
        }
        let notifier = Arc::new(AddressSpaceNotifier::new(pid, Arc::downgrade(self)));
        let handle = self
            .host
            .register_notifier(pid, notifier.clone())
            .map_err(|err| {
                log::error!(
                    "device {}: cannot register notifier for pid {}: {}",
                    self.id,
                    pid,
                    err
                );
                MigrateError::from(err)
            })?;
        notifiers.insert(pid, Registration { notifier, handle });
        log::debug!("device {}: registered pid {}", self.id, pid);
        Ok(())
    }

    /// Unregisters the notifier of `pid` and removes all of its translations.
    pub fn unregister_process(&self, pid: ProcessId) {
        let Some(registration) = self.notifiers.lock().remove(&pid) else {
            return;
        };
        self.host.unregister_notifier(registration.handle);

        let done = Arc::new(Completion::new());
        let removed = {
            let _guard = self.migration_lock.lock();
            self.tlb.remove_process(pid, &done)
        };
        done.wait(self.scheduler.as_ref());
        log::debug!(
            "device {}: unregistered pid {}, removed {} translations",
            self.id,
            pid,
            removed
        );
    }

    pub(crate) fn notifier(&self, pid: ProcessId) -> Option<Arc<AddressSpaceNotifier>> {
        self.notifiers
            .lock()
            .get(&pid)
            .map(|registration| registration.notifier.clone())
    }

    /// Bulk reclaim for an exiting context: every card page it owns goes back to the
    /// card allocator exactly once.
    pub fn free_card_memory(&self, ctid: ContextId) -> usize {
        self.residency.free_all(ctid)
    }

    /// Device teardown: reclaims all card memory and unregisters every chunk of
    /// device-private memory.
    pub fn free_all_memory_regions(&self) {
        let released = self.residency.free_everything();
        self.pages.teardown();
        log::info!(
            "device {}: released {} resident pages and all private memory",
            self.id,
            released
        );
    }

    /// Release path of a device-private page: drop its residency, then return it to
    /// the free list.
    pub(crate) fn release_private_page(&self, pfn: FrameNumber) {
        if self.residency.vacate(&[pfn]) > 0 {
            log::trace!("device {}: page {} released while resident", self.id, pfn);
        }
        self.pages.free(pfn);
    }

    /// Registered contexts, for diagnostics.
    pub fn contexts(&self) -> Vec<(ContextId, ProcessId)> {
        self.contexts
            .lock()
            .iter()
            .map(|(&ctid, &pid)| (ctid, pid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::Emulation;

    #[test]
    fn rejects_invalid_config() {
        let emulation = Emulation::new();
        let config = DeviceConfig::default().chunk_size(3);
        assert!(matches!(
            Device::new(DeviceId(0), config, emulation.services()),
            Err(MigrateError::InvalidArgument)
        ));
    }

    #[test]
    fn process_registration_is_idempotent() {
        let emulation = Emulation::new();
        let device = emulation.device(DeviceId(0));
        device.register_process(ProcessId(1)).unwrap();
        device.register_process(ProcessId(1)).unwrap();
        assert_eq!(emulation.host.notifier_count(), 1);

        device.unregister_process(ProcessId(1));
        assert_eq!(emulation.host.notifier_count(), 0);
        assert!(device.notifier(ProcessId(1)).is_none());
        device.unregister_process(ProcessId(1));
    }

    #[test]
    fn contexts_map_to_processes() {
        let emulation = Emulation::new();
        let device = emulation.device(DeviceId(0));
        device.register_context(ContextId(2), ProcessId(40));
        assert_eq!(device.process_of(ContextId(2)), Some(ProcessId(40)));
        assert_eq!(device.contexts(), alloc::vec![(ContextId(2), ProcessId(40))]);
        device.unregister_context(ContextId(2));
        assert_eq!(device.process_of(ContextId(2)), None);
    }

    #[test]
    fn page_free_callback_returns_page_to_pool() {
        let emulation = Emulation::new();
        let device = emulation.device(DeviceId(0));
        let pfn = device.pages.allocate_one().unwrap();
        let card = device.card.allocate(1, false).unwrap()[0];
        device.residency.attach(
            ContextId(1),
            crate::ResidentPage {
                pfn,
                card_address: card,
                huge: false,
            },
        );

        emulation.host.release_device_page(pfn);
        assert!(!device.residency.contains(pfn));
        assert!(!device.pages.is_allocated(pfn));
        assert_eq!(emulation.card.release_count(card), 1);
    }

    #[test]
    fn teardown_unregisters_everything() {
        let emulation = Emulation::new();
        let device = emulation.device(DeviceId(0));
        device.pages.allocate_one().unwrap();
        assert_eq!(emulation.host.registered_chunks(), 1);
        device.free_all_memory_regions();
        assert_eq!(emulation.host.registered_chunks(), 0);
        assert_eq!(device.pages.total_pages(), 0);
    }

    #[test]
    fn unregistering_context_takes_down_its_translations() {
        let emulation = Emulation::new();
        let device = emulation.device(DeviceId(0));
        let pid = ProcessId(40);
        device.register_context(ContextId(2), pid);
        device.register_context(ContextId(3), pid);
        let target = [Some(crate::TlbTarget::Card(crate::CardAddress::new(0x20_0000)))];
        device
            .tlb
            .install(ContextId(2), pid, VirtualAddress::new(0x1000), &target, false);
        device
            .tlb
            .install(ContextId(3), pid, VirtualAddress::new(0x2000), &target, false);

        device.unregister_context(ContextId(2));

        assert!(device.tlb.lookup(pid, VirtualAddress::new(0x1000)).is_none());
        let (entry, _) = device.tlb.lookup(pid, VirtualAddress::new(0x2000)).unwrap();
        assert_eq!(entry.ctid, ContextId(3));
        let invalidations = emulation.tlb.invalidations();
        assert_eq!(invalidations.len(), 1);
        assert_eq!(invalidations[0].vaddr, VirtualAddress::new(0x1000));
    }
}
