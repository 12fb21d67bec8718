//! Page cache: hash-indexed by page number, with a dirty list and
//! capacity-bounded linear-scan eviction of clean, unreferenced pages.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::Page;
use crate::types::Pgno;
use std::collections::HashMap;
use std::sync::Arc;

/// Default page cache capacity, in pages.
pub const DEFAULT_CACHE_SIZE: usize = 2000;

/// A page cache keyed by page number. Eviction is a linear scan for the
/// first clean, unreferenced page rather than true LRU, per the pager's
/// design notes: adequate because the hot path isn't eviction-bound.
pub struct PageCache {
    pages: HashMap<Pgno, Arc<Page>>,
    /// Insertion order, used only to give eviction a stable scan order
    /// (oldest-inserted first); not an LRU list.
    order: Vec<Pgno>,
    capacity: usize,
}

impl PageCache {
    /// Create an empty cache with the given capacity (page count).
    pub fn new(capacity: usize) -> Self {
        PageCache {
            pages: HashMap::new(),
            order: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// O(1) lookup.
    pub fn get(&self, pgno: Pgno) -> Option<Arc<Page>> {
        self.pages.get(&pgno).cloned()
    }

    /// Insert a page, evicting one clean+unreferenced page first if the
    /// cache is already at capacity. Fails with `Full` if the cache is at
    /// capacity and no page is evictable.
    pub fn put(&mut self, page: Arc<Page>) -> Result<()> {
        let pgno = page.pgno();
        if self.pages.contains_key(&pgno) {
            self.pages.insert(pgno, page);
            return Ok(());
        }

        if self.pages.len() >= self.capacity {
            self.evict_one()?;
        }

        self.pages.insert(pgno, page);
        self.order.push(pgno);
        Ok(())
    }

    /// Remove a page from the cache unconditionally.
    pub fn remove(&mut self, pgno: Pgno) {
        self.pages.remove(&pgno);
        self.order.retain(|&p| p != pgno);
    }

    /// All dirty pages, most-recently-dirtied first. Since dirtying order
    /// isn't separately tracked, pages are returned in reverse insertion
    /// order, which coincides with "most recently touched" for the
    /// pager's write path (new pages are dirtied as they're written).
    pub fn dirty_pages(&self) -> Vec<Arc<Page>> {
        self.order
            .iter()
            .rev()
            .filter_map(|pgno| self.pages.get(pgno))
            .filter(|p| p.is_dirty())
            .cloned()
            .collect()
    }

    /// Flip every page's dirty bit to clean (called right after commit).
    pub fn make_all_clean(&mut self) {
        for page in self.pages.values() {
            page.mark_clean();
        }
    }

    /// Drop every cached page (used on rollback and close).
    pub fn clear(&mut self) {
        self.pages.clear();
        self.order.clear();
    }

    /// Remove every page with `pgno > max_pgno` (used after a rollback
    /// that restores a smaller database size).
    pub fn truncate(&mut self, max_pgno: Pgno) {
        let doomed: Vec<Pgno> = self
            .pages
            .keys()
            .copied()
            .filter(|&p| p > max_pgno)
            .collect();
        for pgno in doomed {
            self.remove(pgno);
        }
    }

    fn evict_one(&mut self) -> Result<()> {
        let victim = self
            .order
            .iter()
            .position(|pgno| {
                self.pages
                    .get(pgno)
                    .map(|p| !p.is_dirty() && p.refcount() == 0)
                    .unwrap_or(true)
            })
            .map(|idx| self.order[idx]);

        match victim {
            Some(pgno) => {
                self.remove(pgno);
                Ok(())
            }
            None => Err(Error::with_message(
                ErrorCode::Full,
                "page cache full: no evictable page",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pgno: Pgno) -> Arc<Page> {
        Arc::new(Page::new(pgno, 4096))
    }

    #[test]
    fn get_returns_none_for_missing_page() {
        let cache = PageCache::new(10);
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut cache = PageCache::new(10);
        let p = page(1);
        cache.put(p.clone()).unwrap();
        assert!(Arc::ptr_eq(&cache.get(1).unwrap(), &p));
    }

    #[test]
    fn cache_full_when_all_pages_dirty_or_referenced() {
        let mut cache = PageCache::new(2);
        let p1 = page(1);
        p1.write(0, b"x").unwrap();
        let p2 = page(2);
        p2.reference();
        cache.put(p1).unwrap();
        cache.put(p2).unwrap();

        let p3 = page(3);
        let err = cache.put(p3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Full);
    }

    #[test]
    fn evicts_clean_unreferenced_page() {
        let mut cache = PageCache::new(2);
        let p1 = page(1);
        p1.unreference(); // refcount 0, clean
        let p2 = page(2);
        p2.reference();
        cache.put(p1).unwrap();
        cache.put(p2).unwrap();

        let p3 = page(3);
        cache.put(p3).unwrap();

        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn dirty_pages_only_returns_dirty() {
        let mut cache = PageCache::new(10);
        let p1 = page(1);
        p1.write(0, b"a").unwrap();
        let p2 = page(2);
        cache.put(p1.clone()).unwrap();
        cache.put(p2).unwrap();

        let dirty = cache.dirty_pages();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].pgno(), 1);
    }

    #[test]
    fn make_all_clean_clears_dirty_list() {
        let mut cache = PageCache::new(10);
        let p1 = page(1);
        p1.write(0, b"a").unwrap();
        cache.put(p1).unwrap();
        cache.make_all_clean();
        assert!(cache.dirty_pages().is_empty());
    }

    #[test]
    fn truncate_drops_pages_beyond_new_size() {
        let mut cache = PageCache::new(10);
        cache.put(page(1)).unwrap();
        cache.put(page(5)).unwrap();
        cache.truncate(2);
        assert!(cache.get(1).is_some());
        assert!(cache.get(5).is_none());
    }
}
