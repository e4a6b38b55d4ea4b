//! Residency registry: which context owns each card-resident page.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::{CardAddress, CardMemoryAllocator, ContextId, FrameNumber};

/// Metadata of a device-private page whose data is on the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidentPage {
    pub pfn: FrameNumber,
    pub card_address: CardAddress,
    /// The page is part of a huge page; `card_address` lies inside a huge card block.
    pub huge: bool,
}

#[derive(Default)]
struct Registry {
    contexts: BTreeMap<ContextId, Vec<ResidentPage>>,
    owners: BTreeMap<FrameNumber, ContextId>,
    /// Resident sub-pages of every live huge card block, by block base.
    blocks: BTreeMap<CardAddress, usize>,
}

impl Registry {
    fn detach(&mut self, pfn: FrameNumber) -> Option<(ContextId, ResidentPage)> {
        let ctid = self.owners.remove(&pfn)?;
        let pages = self.contexts.get_mut(&ctid)?;
        let index = pages.iter().position(|page| page.pfn == pfn)?;
        let page = pages.swap_remove(index);
        if pages.is_empty() {
            self.contexts.remove(&ctid);
        }
        Some((ctid, page))
    }

    /// Drops one user of the block `page` lies in. Returns the block base once its
    /// last sub-page is gone.
    fn put_block(&mut self, page: &ResidentPage, huge_size: u64) -> Option<CardAddress> {
        if !page.huge {
            return None;
        }
        let base = page.card_address.align_down(huge_size);
        let users = self.blocks.get_mut(&base)?;
        *users -= 1;
        if *users > 0 {
            return None;
        }
        self.blocks.remove(&base);
        Some(base)
    }
}

/// Per-context lists of card-resident pages.
///
/// The registry is the only place that returns card memory to the card allocator:
/// a page's card memory is released exactly when its record is removed, and a huge
/// card block when the record of its last resident sub-page is.
pub struct ResidencyRegistry {
    card: Arc<dyn CardMemoryAllocator>,
    huge_size: u64,
    inner: Mutex<Registry>,
}

impl ResidencyRegistry {
    pub fn new(card: Arc<dyn CardMemoryAllocator>, huge_size: u64) -> Self {
        Self {
            card,
            huge_size,
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Records `page` as owned by `ctid`.
    ///
    /// # Panics
    ///
    /// Panics if the page is already resident; two owners for one device page means
    /// the bookkeeping is corrupt.
    pub fn attach(&self, ctid: ContextId, page: ResidentPage) {
        let mut inner = self.inner.lock();
        if let Some(owner) = inner.owners.insert(page.pfn, ctid) {
            panic!("device page {} attached to context {ctid} while owned by {owner}", page.pfn);
        }
        if page.huge {
            *inner
                .blocks
                .entry(page.card_address.align_down(self.huge_size))
                .or_default() += 1;
        }
        inner.contexts.entry(ctid).or_default().push(page);
    }

    /// Returns the owner and metadata of a resident page.
    pub fn lookup(&self, pfn: FrameNumber) -> Option<(ContextId, ResidentPage)> {
        let inner = self.inner.lock();
        let ctid = *inner.owners.get(&pfn)?;
        let page = inner
            .contexts
            .get(&ctid)?
            .iter()
            .find(|page| page.pfn == pfn)
            .copied()?;
        Some((ctid, page))
    }

    /// Detaches every listed page that is resident and releases its card memory in
    /// one call per page size. Returns the number of pages detached.
    pub fn vacate(&self, pfns: &[FrameNumber]) -> usize {
        let (detached, blocks) = {
            let mut inner = self.inner.lock();
            let detached: Vec<ResidentPage> = pfns
                .iter()
                .filter_map(|&pfn| inner.detach(pfn).map(|(_, page)| page))
                .collect();
            let blocks: Vec<CardAddress> = detached
                .iter()
                .filter_map(|page| inner.put_block(page, self.huge_size))
                .collect();
            (detached, blocks)
        };
        self.release(&detached, &blocks);
        detached.len()
    }

    /// Detaches every page owned by `ctid` and releases its card memory.
    pub fn free_all(&self, ctid: ContextId) -> usize {
        let (detached, blocks) = {
            let mut inner = self.inner.lock();
            let pages = inner.contexts.remove(&ctid).unwrap_or_default();
            let mut blocks = Vec::new();
            for page in &pages {
                inner.owners.remove(&page.pfn);
                blocks.extend(inner.put_block(page, self.huge_size));
            }
            (pages, blocks)
        };
        self.release(&detached, &blocks);
        log::debug!("context {}: released {} resident pages", ctid, detached.len());
        detached.len()
    }

    /// Detaches every page of every context.
    pub fn free_everything(&self) -> usize {
        let contexts: Vec<ContextId> = self.inner.lock().contexts.keys().copied().collect();
        contexts.into_iter().map(|ctid| self.free_all(ctid)).sum()
    }

    /// Returns the card memory of detached regular pages, and the huge blocks whose
    /// last sub-page was detached.
    fn release(&self, pages: &[ResidentPage], blocks: &[CardAddress]) {
        let regular: Vec<CardAddress> = pages
            .iter()
            .filter(|page| !page.huge)
            .map(|page| page.card_address)
            .collect();

        if !regular.is_empty() {
            log::trace!("releasing {} card pages", regular.len());
            self.card.release(&regular, false);
        }
        if !blocks.is_empty() {
            log::trace!("releasing {} huge card pages", blocks.len());
            self.card.release(blocks, true);
        }
    }

    pub fn pages_of(&self, ctid: ContextId) -> Vec<ResidentPage> {
        self.inner
            .lock()
            .contexts
            .get(&ctid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.lock().owners.len()
    }

    pub fn contains(&self, pfn: FrameNumber) -> bool {
        self.inner.lock().owners.contains_key(&pfn)
    }
}
