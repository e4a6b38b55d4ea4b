//! Card memory emulation.

use std::collections::{BTreeMap, BTreeSet};

use alloc::vec::Vec;

use spin::Mutex;

use crate::{CardAddress, CardAllocError, CardMemoryAllocator, PAGE_SIZE};

struct Pool {
    /// Pages that may be handed out, counted from the window base.
    capacity: u64,
    used: BTreeSet<u64>,
    /// Live allocations and whether each is a huge block.
    live: BTreeMap<CardAddress, bool>,
    releases: BTreeMap<CardAddress, usize>,
}

/// Hands out card addresses from a window starting at one huge page, so that no
/// address is zero and huge blocks are naturally aligned.
pub struct EmulatedCardAllocator {
    huge_size: u64,
    pool: Mutex<Pool>,
}

impl EmulatedCardAllocator {
    pub fn new(capacity_bytes: u64, huge_size: u64) -> Self {
        Self {
            huge_size,
            pool: Mutex::new(Pool {
                capacity: capacity_bytes / PAGE_SIZE,
                used: BTreeSet::new(),
                live: BTreeMap::new(),
                releases: BTreeMap::new(),
            }),
        }
    }

    /// Shrinks or grows the window to `pages` regular pages.
    pub fn set_capacity_pages(&self, pages: u64) {
        self.pool.lock().capacity = pages;
    }

    /// How many times `address` was passed to `release`.
    pub fn release_count(&self, address: CardAddress) -> usize {
        self.pool.lock().releases.get(&address).copied().unwrap_or(0)
    }

    /// Allocations not yet released.
    pub fn outstanding(&self) -> usize {
        self.pool.lock().live.len()
    }

    fn address(&self, index: u64) -> CardAddress {
        CardAddress::new(self.huge_size + index * PAGE_SIZE)
    }

    fn span(&self, huge: bool) -> u64 {
        if huge { self.huge_size / PAGE_SIZE } else { 1 }
    }
}

impl CardMemoryAllocator for EmulatedCardAllocator {
    fn allocate(&self, count: usize, huge: bool) -> Result<Vec<CardAddress>, CardAllocError> {
        let span = self.span(huge);
        let mut pool = self.pool.lock();

        let mut found = Vec::with_capacity(count);
        let mut start = 0;
        while found.len() < count && start + span <= pool.capacity {
            if (start..start + span).all(|page| !pool.used.contains(&page)) {
                found.push(start);
            }
            start += span;
        }
        if found.len() < count {
            return Err(CardAllocError {
                requested: count,
                huge,
            });
        }

        let addresses = found
            .into_iter()
            .map(|start| {
                pool.used.extend(start..start + span);
                let address = self.address(start);
                pool.live.insert(address, huge);
                address
            })
            .collect();
        Ok(addresses)
    }

    fn release(&self, addresses: &[CardAddress], huge: bool) {
        let span = self.span(huge);
        let mut pool = self.pool.lock();
        for &address in addresses {
            *pool.releases.entry(address).or_insert(0) += 1;
            if pool.live.remove(&address).is_some() {
                let start = (address.as_u64() - self.huge_size) / PAGE_SIZE;
                for page in start..start + span {
                    pool.used.remove(&page);
                }
            }
        }
    }
}
