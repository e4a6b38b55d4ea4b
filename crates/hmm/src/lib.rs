#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Heterogeneous Memory Migration (HMM)
//!
//! The migration core of an accelerator driver. It moves pages of a host process
//! between host RAM and the accelerator's on-board memory while the process keeps
//! using the same virtual addresses, and keeps the accelerator's TLBs consistent
//! with wherever each page currently lives. It provides:
//!
//! - Device-ward and host-ward migration with all-or-nothing rollback.
//! - Accelerator TLB management, including the hardware entry encoding.
//! - Fault dispatch for accelerator faults, host-side fault resolution and CPU
//!   faults on card-resident pages.
//! - Invalidation notifiers that tear translations down when the host changes an
//!   address space.
//! - A device-private page pool and a per-context residency registry that owns
//!   every page of card memory handed out.
//!
//! The host memory manager, the DMA engine, the card-memory allocator and the TLB
//! register interface are collaborators reached through traits. The
//! `software-emulation` feature compiles an in-memory implementation of all of them.

extern crate alloc;

mod address;
mod card;
mod config;
mod device;
mod dma;
mod error;
mod fault;
mod host;
mod migrate;
mod notifier;
mod numbers;
mod private_pages;
mod residency;
mod tlb;

#[cfg(any(test, feature = "software-emulation"))]
pub mod emulation;

pub use address::{CardAddress, PhysicalAddress, VirtualAddress};
pub use card::{CardAllocError, CardMemoryAllocator};
pub use config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FAULT_TIMEOUT_MS, DEFAULT_MAX_MAP_PAGES, DeviceConfig,
    TLB_CTID_BITS, TLB_PADDR_BITS, TLB_STRM_BITS, TLB_VADDR_BITS, TlbGeometry,
};
pub use device::{Device, DeviceServices};
pub use dma::{Completion, DmaClass, DmaEngine, DmaRequest};
pub use error::{HostError, MigrateError, Result};
pub use fault::{AccessKind, MigrateArgs};
pub use host::{
    ChunkHandle, DeviceMemoryChunk, DevicePagemapOps, DestinationPage, Direction,
    HostMemoryManager, InvalidationEvent, InvalidationNotifier, InvalidationRange, Mapping,
    MigrateFlags, NotifierHandle, Scheduler, SourcePage, StageRequest, StagedMigration,
    StagingHandle, Vma,
};
pub use migrate::MigrationRequest;
pub use notifier::AddressSpaceNotifier;
pub use numbers::{ContextId, DeviceId, FrameNumber, PAGE_SHIFT, PAGE_SIZE, PageNumber, ProcessId};
pub use private_pages::PrivatePageAllocator;
pub use residency::{ResidencyRegistry, ResidentPage};
pub use tlb::{InvalidateRequest, RemovedEntry, TlbEntry, TlbMappingManager, TlbPort, TlbTarget};

pub(crate) use dma::DmaChannel;
