//! Software emulation of the collaborators a device is built on.
//!
//! Everything here runs in ordinary host memory so the migration core can be driven
//! end to end from tests: the host memory manager keeps per-process page tables in
//! maps, the card allocator hands out addresses from a fixed window, the DMA engine
//! and TLB port record what they are asked to do and complete immediately, and the
//! scheduler's clock only moves when someone yields.

mod card;
mod host;

pub use card::EmulatedCardAllocator;
pub use host::{EmulatedHost, Residence};

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{
    CardAddress, Completion, Device, DeviceConfig, DeviceId, DeviceServices, DmaClass,
    DmaEngine, DmaRequest, InvalidateRequest, PAGE_SIZE, PhysicalAddress, Scheduler, TlbPort,
};

/// Card memory available to an [`Emulation`]: 64 huge pages.
pub const EMULATED_CARD_BYTES: u64 = 64 * 512 * PAGE_SIZE;

/// One copy submitted to the [`EmulatedDma`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaCopy {
    pub class: DmaClass,
    pub host: Vec<PhysicalAddress>,
    pub card: Vec<CardAddress>,
    pub huge: bool,
}

/// Records copies and completes them at once.
#[derive(Default)]
pub struct EmulatedDma {
    copies: Mutex<Vec<DmaCopy>>,
    hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl EmulatedDma {
    pub fn copies(&self) -> Vec<DmaCopy> {
        self.copies.lock().clone()
    }

    pub fn clear(&self) {
        self.copies.lock().clear();
    }

    /// Runs `hook` while each later copy is in flight.
    pub fn on_copy(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    fn record(&self, class: DmaClass, request: &DmaRequest<'_>, done: &Arc<Completion>) {
        self.copies.lock().push(DmaCopy {
            class,
            host: request.host.to_vec(),
            card: request.card.to_vec(),
            huge: request.huge,
        });
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        done.signal();
    }
}

impl DmaEngine for EmulatedDma {
    fn trigger_copy_sync(&self, request: &DmaRequest<'_>, done: &Arc<Completion>) {
        self.record(DmaClass::Sync, request, done);
    }

    fn trigger_copy_offload(&self, request: &DmaRequest<'_>, done: &Arc<Completion>) {
        self.record(DmaClass::Offload, request, done);
    }
}

/// Records TLB writes and acknowledges the last invalidation of every batch.
#[derive(Default)]
pub struct EmulatedTlbPort {
    writes: Mutex<Vec<(bool, [u64; 2])>>,
    invalidations: Mutex<Vec<InvalidateRequest>>,
}

impl EmulatedTlbPort {
    pub fn writes(&self) -> Vec<(bool, [u64; 2])> {
        self.writes.lock().clone()
    }

    pub fn invalidations(&self) -> Vec<InvalidateRequest> {
        self.invalidations.lock().clone()
    }
}

impl TlbPort for EmulatedTlbPort {
    fn write_entry(&self, huge: bool, words: [u64; 2]) {
        self.writes.lock().push((huge, words));
    }

    fn invalidate(&self, request: &InvalidateRequest, done: &Arc<Completion>) {
        self.invalidations.lock().push(*request);
        if request.last {
            done.signal();
        }
    }
}

/// A clock that advances by `tick_ms` on every yield.
pub struct EmulatedScheduler {
    now: AtomicU64,
    tick_ms: u64,
}

impl EmulatedScheduler {
    pub const fn new(tick_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            tick_ms,
        }
    }
}

impl Scheduler for EmulatedScheduler {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn yield_now(&self) {
        self.now.fetch_add(self.tick_ms, Ordering::AcqRel);
        std::thread::yield_now();
    }
}

/// A full set of emulated collaborators, shared by every device built from it.
pub struct Emulation {
    pub host: Arc<EmulatedHost>,
    pub dma: Arc<EmulatedDma>,
    pub card: Arc<EmulatedCardAllocator>,
    pub tlb: Arc<EmulatedTlbPort>,
    pub scheduler: Arc<EmulatedScheduler>,
}

impl Default for Emulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulation {
    pub fn new() -> Self {
        let huge_size = DeviceConfig::default().huge_tlb.page_size();
        Self {
            host: Arc::new(EmulatedHost::new()),
            dma: Arc::new(EmulatedDma::default()),
            card: Arc::new(EmulatedCardAllocator::new(EMULATED_CARD_BYTES, huge_size)),
            tlb: Arc::new(EmulatedTlbPort::default()),
            scheduler: Arc::new(EmulatedScheduler::new(1)),
        }
    }

    pub fn services(&self) -> DeviceServices {
        DeviceServices {
            host: self.host.clone(),
            dma: self.dma.clone(),
            card: self.card.clone(),
            tlb: self.tlb.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// A device with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the device cannot be built.
    pub fn device(&self, id: DeviceId) -> Arc<Device> {
        self.device_with(id, DeviceConfig::default())
    }

    /// # Panics
    ///
    /// Panics if `config` is rejected.
    pub fn device_with(&self, id: DeviceId, config: DeviceConfig) -> Arc<Device> {
        match Device::new(id, config, self.services()) {
            Ok(device) => device,
            Err(err) => panic!("emulated device {id} rejected its configuration: {err}"),
        }
    }
}
