//! The return-thunk arena.
//!
//! Exit tracing replaces each on-stack return address with the address of a
//! small return thunk that stashes the real address and the entry-time
//! cycle count. Thunks live in pages owned by one thread, handed out and
//! reclaimed in stack order; pages are never freed. Every page is entered
//! into a process-wide registry so that foreign stack walkers (a garbage
//! collector, a sampling profiler) can be given the original return address
//! behind any swizzled one, chasing chains when a thunk's stashed address is
//! itself a thunk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::debug;

/// Synthetic address space reserved for thunk pages, far away from any
/// image RVA.
const PAGE_BASE: u32 = 0x7000_0000;
pub const THUNK_PAGE_SIZE: u32 = 0x1000;
/// Bytes per thunk slot: the stub plus the stashed state.
pub const THUNK_STRIDE: u32 = 16;
const THUNKS_PER_PAGE: usize = (THUNK_PAGE_SIZE / THUNK_STRIDE) as usize;

/// State stashed in one thunk slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thunk {
    pub return_address: u32,
    pub function: u32,
    pub entry_cycles: u64,
}

type PageSlots = Arc<Mutex<Vec<Option<Thunk>>>>;

/// Process-wide map of every thunk page, keyed by page base address. Only
/// the resolver takes this lock; owners touch their slots directly.
#[derive(Default)]
pub struct PageRegistry {
    pages: Mutex<BTreeMap<u32, PageSlots>>,
}

impl PageRegistry {
    pub fn new() -> Arc<PageRegistry> {
        Arc::new(PageRegistry::default())
    }

    fn register(&self, slots: PageSlots) -> u32 {
        let mut pages = self.pages.lock().unwrap();
        let base = PAGE_BASE + pages.len() as u32 * THUNK_PAGE_SIZE;
        pages.insert(base, slots);
        debug!("registered thunk page at {base:#x}");
        base
    }

    fn thunk_at(&self, address: u32) -> Option<Thunk> {
        // Clone the page arc out so the registry lock is not held while the
        // page lock is taken.
        let (base, slots) = {
            let pages = self.pages.lock().unwrap();
            let (&base, slots) = pages.range(..=address).next_back()?;
            if address >= base + THUNK_PAGE_SIZE || (address - base) % THUNK_STRIDE != 0 {
                return None;
            }
            (base, slots.clone())
        };
        let slot = ((address - base) / THUNK_STRIDE) as usize;
        let thunk = slots.lock().unwrap().get(slot).copied().flatten();
        thunk
    }

    /// Follows swizzle chains from `address` down to the original return
    /// address. `None` when `address` points into no thunk page: it is
    /// already a real return address.
    pub fn resolve_return_address(&self, address: u32) -> Option<u32> {
        let mut current = self.thunk_at(address)?;
        while let Some(next) = self.thunk_at(current.return_address) {
            current = next;
        }
        Some(current.return_address)
    }
}

struct Page {
    base: u32,
    slots: PageSlots,
}

/// One thread's pool of return thunks.
pub struct ThunkArena {
    registry: Arc<PageRegistry>,
    pages: Vec<Page>,
    /// Count of live thunks, in hand-out order across pages.
    depth: usize,
}

impl ThunkArena {
    pub fn new(registry: Arc<PageRegistry>) -> ThunkArena {
        ThunkArena {
            registry,
            pages: Vec::new(),
            depth: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Hands out the next thunk in stack order, growing by a page when the
    /// pool is exhausted. Returns the thunk's address.
    pub fn acquire(&mut self, thunk: Thunk) -> u32 {
        if self.depth == self.pages.len() * THUNKS_PER_PAGE {
            let slots: PageSlots = Arc::new(Mutex::new(vec![None; THUNKS_PER_PAGE]));
            let base = self.registry.register(slots.clone());
            self.pages.push(Page { base, slots });
        }
        let page = &self.pages[self.depth / THUNKS_PER_PAGE];
        let slot = self.depth % THUNKS_PER_PAGE;
        page.slots.lock().unwrap()[slot] = Some(thunk);
        self.depth += 1;
        page.base + slot as u32 * THUNK_STRIDE
    }

    /// Reclaims the most recently handed-out thunk and returns its stashed
    /// state. Pages are kept.
    pub fn release_top(&mut self) -> Result<Thunk> {
        let new_depth = self.depth.checked_sub(1).context("thunk arena is empty")?;
        self.depth = new_depth;
        let page = &self.pages[new_depth / THUNKS_PER_PAGE];
        let slot = new_depth % THUNKS_PER_PAGE;
        page.slots.lock().unwrap()[slot]
            .take()
            .context("thunk slot already reclaimed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thunk(return_address: u32) -> Thunk {
        Thunk {
            return_address,
            function: 0x4000,
            entry_cycles: 1,
        }
    }

    #[test]
    fn stack_order_hand_out_and_reclaim() {
        let registry = PageRegistry::new();
        let mut arena = ThunkArena::new(registry);
        let a = arena.acquire(thunk(0x1000));
        let b = arena.acquire(thunk(0x2000));
        assert_ne!(a, b);
        assert_eq!(arena.release_top().unwrap().return_address, 0x2000);
        // The slot is reused at the same address.
        assert_eq!(arena.acquire(thunk(0x3000)), b);
    }

    #[test]
    fn pages_grow_and_never_shrink() {
        let registry = PageRegistry::new();
        let mut arena = ThunkArena::new(registry);
        for i in 0..THUNKS_PER_PAGE + 1 {
            arena.acquire(thunk(i as u32));
        }
        assert_eq!(arena.page_count(), 2);
        for _ in 0..THUNKS_PER_PAGE + 1 {
            arena.release_top().unwrap();
        }
        assert_eq!(arena.depth(), 0);
        assert_eq!(arena.page_count(), 2);
    }

    #[test]
    fn resolver_sees_through_swizzle_chains() {
        let registry = PageRegistry::new();
        let mut arena = ThunkArena::new(registry.clone());
        let first = arena.acquire(thunk(0xbeef_0000));
        // A recursive hook swizzled an already-swizzled address.
        let second = arena.acquire(thunk(first));
        assert_eq!(registry.resolve_return_address(first), Some(0xbeef_0000));
        assert_eq!(registry.resolve_return_address(second), Some(0xbeef_0000));
    }

    #[test]
    fn foreign_addresses_resolve_to_nothing() {
        let registry = PageRegistry::new();
        let mut arena = ThunkArena::new(registry.clone());
        arena.acquire(thunk(0x1234));
        assert_eq!(registry.resolve_return_address(0x0040_1000), None);
        // Misaligned pointer into a page is not a thunk either.
        assert_eq!(registry.resolve_return_address(PAGE_BASE + 3), None);
    }

    #[test]
    fn pages_from_two_threads_share_one_registry() {
        let registry = PageRegistry::new();
        let mut a = ThunkArena::new(registry.clone());
        let mut b = ThunkArena::new(registry.clone());
        let ta = a.acquire(thunk(0x1111));
        let tb = b.acquire(thunk(0x2222));
        assert_eq!(registry.resolve_return_address(ta), Some(0x1111));
        assert_eq!(registry.resolve_return_address(tb), Some(0x2222));
    }
}
