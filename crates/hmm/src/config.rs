//! Device configuration and accelerator TLB geometry.

use crate::{MigrateError, PAGE_SHIFT, PAGE_SIZE, Result};

/// Width of the virtual address the accelerator TLB translates.
pub const TLB_VADDR_BITS: u32 = 48;

/// Width of the physical address a TLB entry can hold.
pub const TLB_PADDR_BITS: u32 = 40;

/// Bits reserved for the context id in a TLB entry.
pub const TLB_CTID_BITS: u32 = 6;

/// Bits reserved for the access direction in a TLB entry.
pub const TLB_STRM_BITS: u32 = 2;

/// Default amount of device-private address space registered per allocator growth.
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Default budget for the host fault resolution loop, matching the host memory
/// manager's own range-fault timeout.
pub const DEFAULT_FAULT_TIMEOUT_MS: u64 = 1000;

/// Default bound on TLB entries installed by a single call.
pub const DEFAULT_MAX_MAP_PAGES: usize = 512;

/// Layout of one accelerator TLB (regular or huge).
///
/// The accelerator keeps a set-associative TLB per page size. A virtual page
/// number is split into a set index (`key`) and a `tag`; the remaining masks are
/// derived from the page shift and the address widths the hardware supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbGeometry {
    /// log2 of the page size this TLB translates.
    pub page_shift: u32,
    /// Number of set-index bits.
    pub key_size: u32,
    /// Ways per set.
    pub assoc: u32,
}

impl TlbGeometry {
    /// Creates a geometry for the given page shift and set-index width.
    pub const fn new(page_shift: u32, key_size: u32, assoc: u32) -> Self {
        Self {
            page_shift,
            key_size,
            assoc,
        }
    }

    /// Geometry of the regular-page TLB.
    pub const fn regular() -> Self {
        Self::new(PAGE_SHIFT, 6, 4)
    }

    /// Geometry of the huge-page TLB (2 MiB pages).
    pub const fn huge() -> Self {
        Self::new(21, 6, 2)
    }

    /// Page size in bytes.
    pub const fn page_size(&self) -> u64 {
        1 << self.page_shift
    }

    /// Mask selecting the page-aligned part of an address.
    pub const fn page_mask(&self) -> u64 {
        !(self.page_size() - 1)
    }

    pub const fn key_mask(&self) -> u64 {
        (1 << self.key_size) - 1
    }

    pub const fn tag_size(&self) -> u32 {
        TLB_VADDR_BITS - self.page_shift - self.key_size
    }

    pub const fn tag_mask(&self) -> u64 {
        (1 << self.tag_size()) - 1
    }

    pub const fn phy_size(&self) -> u32 {
        TLB_PADDR_BITS - self.page_shift
    }

    pub const fn phy_mask(&self) -> u64 {
        (1 << self.phy_size()) - 1
    }
}

/// Per-device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Bytes of device-private address space registered whenever the private page
    /// pool runs dry.
    pub chunk_size: u64,
    /// Regular-page TLB layout.
    pub regular_tlb: TlbGeometry,
    /// Huge-page TLB layout.
    pub huge_tlb: TlbGeometry,
    /// Budget of the host fault resolution loop.
    pub fault_timeout_ms: u64,
    /// Upper bound on entries installed by one TLB install call.
    pub max_map_pages: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            regular_tlb: TlbGeometry::regular(),
            huge_tlb: TlbGeometry::huge(),
            fault_timeout_ms: DEFAULT_FAULT_TIMEOUT_MS,
            max_map_pages: DEFAULT_MAX_MAP_PAGES,
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    #[must_use]
    pub const fn huge_tlb(mut self, geometry: TlbGeometry) -> Self {
        self.huge_tlb = geometry;
        self
    }

    #[must_use]
    pub const fn fault_timeout_ms(mut self, timeout: u64) -> Self {
        self.fault_timeout_ms = timeout;
        self
    }

    #[must_use]
    pub const fn max_map_pages(mut self, pages: usize) -> Self {
        self.max_map_pages = pages;
        self
    }

    /// Returns the geometry for the requested granularity.
    pub const fn tlb(&self, huge: bool) -> &TlbGeometry {
        if huge { &self.huge_tlb } else { &self.regular_tlb }
    }

    /// Number of regular pages in one huge page.
    pub const fn pages_per_huge(&self) -> u64 {
        1 << (self.huge_tlb.page_shift - self.regular_tlb.page_shift)
    }

    /// Number of regular pages covered by one granule at the given granularity.
    pub const fn granule_pages(&self, huge: bool) -> u64 {
        if huge { self.pages_per_huge() } else { 1 }
    }

    /// Number of regular pages in one device-private chunk.
    pub const fn pages_per_chunk(&self) -> u64 {
        self.chunk_size / PAGE_SIZE
    }

    /// Checks that the configuration describes hardware the core can drive.
    pub fn validate(&self) -> Result<()> {
        if self.regular_tlb.page_shift != PAGE_SHIFT {
            log::error!(
                "regular TLB page shift {} does not match the host page shift {}",
                self.regular_tlb.page_shift,
                PAGE_SHIFT
            );
            return Err(MigrateError::InvalidArgument);
        }
        if self.huge_tlb.page_shift <= self.regular_tlb.page_shift
            || self.huge_tlb.page_shift >= TLB_PADDR_BITS
        {
            log::error!("invalid huge TLB page shift {}", self.huge_tlb.page_shift);
            return Err(MigrateError::InvalidArgument);
        }
        for geometry in [&self.regular_tlb, &self.huge_tlb] {
            if geometry.key_size + geometry.page_shift >= TLB_VADDR_BITS {
                log::error!("TLB key size {} leaves no tag bits", geometry.key_size);
                return Err(MigrateError::InvalidArgument);
            }
        }
        if self.chunk_size == 0 || self.chunk_size % PAGE_SIZE != 0 {
            log::error!("chunk size {:#x} is not a whole number of pages", self.chunk_size);
            return Err(MigrateError::InvalidArgument);
        }
        if self.max_map_pages == 0 {
            return Err(MigrateError::InvalidArgument);
        }
        Ok(())
    }
}
