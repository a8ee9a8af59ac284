//! Indirect-pointer page cache.
//!
//! Three independent LRU maps, one per indirect level, each keyed by the
//! entity address of a pointer block and holding the decoded pointer
//! array. Entries are weak lookups, never ownership: the disk stays the
//! source of truth, and any entry may be discarded at any time. Updates
//! write through — after a pointer block changes on disk, the cached
//! copy (if any) is patched at the same offset. Only full pages are ever
//! admitted; a partial read must not populate the cache.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Entries per level.
pub const POINTER_CACHE_CAPACITY: usize = 128;

/// Per-level LRU of decoded pointer pages.
pub struct PointerCache {
    levels: [LruCache<u32, Vec<u32>>; 3],
}

impl std::fmt::Debug for PointerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerCache")
            .field("lv1", &self.levels[0].len())
            .field("lv2", &self.levels[1].len())
            .field("lv3", &self.levels[2].len())
            .finish()
    }
}

impl Default for PointerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerCache {
    #[must_use]
    pub fn new() -> Self {
        let cap = NonZeroUsize::new(POINTER_CACHE_CAPACITY).expect("capacity is nonzero");
        Self {
            levels: std::array::from_fn(|_| LruCache::new(cap)),
        }
    }

    fn level(&mut self, lv: usize) -> Option<&mut LruCache<u32, Vec<u32>>> {
        if (1..=3).contains(&lv) {
            Some(&mut self.levels[lv - 1])
        } else {
            None
        }
    }

    /// Fetch the cached page for `addr` at `lv`, refreshing its recency.
    pub fn lookup(&mut self, lv: usize, addr: u32) -> Option<&Vec<u32>> {
        self.level(lv)?.get(&addr)
    }

    /// Admit a full page, evicting the least recently used on overflow.
    pub fn insert(&mut self, lv: usize, addr: u32, page: Vec<u32>) {
        if let Some(level) = self.level(lv) {
            level.put(addr, page);
        }
    }

    /// Write-through update: patch a cached page in place, or admit the
    /// write if it covers a whole page. Partial writes to uncached pages
    /// are dropped.
    pub fn patch_or_fill(
        &mut self,
        lv: usize,
        addr: u32,
        entries: &[u32],
        offset: usize,
        full_page_len: usize,
    ) {
        let Some(level) = self.level(lv) else {
            return;
        };
        if let Some(page) = level.get_mut(&addr) {
            if offset + entries.len() <= page.len() {
                page[offset..offset + entries.len()].copy_from_slice(entries);
            }
        } else if entries.len() == full_page_len {
            level.put(addr, entries.to_vec());
        }
    }
}
