//! Nested savepoints: named checkpoints within a write transaction that can
//! be released (merged into the next-outer scope) or rolled back to
//! (restoring every page touched since they were opened).

use crate::error::Result;
use crate::storage::page::Page;
use crate::storage::pcache::PageCache;
use crate::types::Pgno;
use std::collections::HashMap;
use std::sync::Arc;

/// A single named savepoint: the database size at the moment it was
/// opened, the journal write offset at that moment (so a rollback-to can
/// also truncate the journal back to it), and a snapshot of every page's
/// bytes as they stood the first time that page was touched after the
/// savepoint was opened.
pub struct Savepoint {
    name: String,
    db_size_at_open: u32,
    journal_offset_at_open: u64,
    page_snapshots: HashMap<Pgno, Vec<u8>>,
}

impl Savepoint {
    pub fn new(name: impl Into<String>, db_size_at_open: u32, journal_offset_at_open: u64) -> Self {
        Savepoint {
            name: name.into(),
            db_size_at_open,
            journal_offset_at_open,
            page_snapshots: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_size_at_open(&self) -> u32 {
        self.db_size_at_open
    }

    pub fn journal_offset_at_open(&self) -> u64 {
        self.journal_offset_at_open
    }

    /// Record a page's pre-modification bytes, if this savepoint hasn't
    /// already seen that page. The first touch after the savepoint was
    /// opened is the only one that matters for rollback-to.
    pub fn note_page_before_write(&mut self, pgno: Pgno, page: &Page) {
        self.page_snapshots
            .entry(pgno)
            .or_insert_with(|| page.clone_detached());
    }

    pub fn snapshot_for(&self, pgno: Pgno) -> Option<&[u8]> {
        self.page_snapshots.get(&pgno).map(|v| v.as_slice())
    }

    pub fn touched_pages(&self) -> impl Iterator<Item = Pgno> + '_ {
        self.page_snapshots.keys().copied()
    }
}

/// Newest-first stack of open savepoints for the current write
/// transaction.
#[derive(Default)]
pub struct SavepointStack {
    stack: Vec<Savepoint>,
}

impl SavepointStack {
    pub fn new() -> Self {
        SavepointStack { stack: Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Open a new, innermost savepoint.
    pub fn open(&mut self, name: impl Into<String>, db_size: u32, journal_offset: u64) {
        self.stack.push(Savepoint::new(name, db_size, journal_offset));
    }

    /// Every open savepoint needs to learn about a page's pre-write bytes
    /// the first time it's touched, so that each one can restore
    /// independently if rolled back to later.
    pub fn note_page_before_write(&mut self, pgno: Pgno, page: &Page) {
        for sp in self.stack.iter_mut() {
            sp.note_page_before_write(pgno, page);
        }
    }

    /// Release `name`: drop it and every savepoint opened after it,
    /// merging their changes into the next-outer scope (or the enclosing
    /// transaction, if none remain).
    pub fn release(&mut self, name: &str) -> bool {
        match self.stack.iter().position(|sp| sp.name() == name) {
            Some(idx) => {
                self.stack.truncate(idx);
                true
            }
            None => false,
        }
    }

    /// Roll back to `name`: find it (searching from the target outward to
    /// the newest savepoint so a rollback to an outer savepoint also
    /// undoes everything nested inside it), apply the union of its page
    /// snapshots and every savepoint nested inside it to `cache`
    /// (creating a cache entry for any page not already resident), drop
    /// every savepoint newer than it, and keep `name` itself open.
    /// Returns `Ok(false)` if `name` isn't on the stack; propagates a
    /// cache-full error if a restored page can't be materialized back
    /// into the cache.
    pub fn rollback_to(&mut self, name: &str, cache: &mut PageCache) -> Result<bool> {
        let idx = match self.stack.iter().position(|sp| sp.name() == name) {
            Some(idx) => idx,
            None => return Ok(false),
        };

        // Walk from the target outward to the newest savepoint: each
        // page's *earliest* recorded snapshot in that range — the
        // target's own, if it has one — is its state when the target
        // savepoint was opened, so the first snapshot seen per page wins.
        let mut restore: HashMap<Pgno, &[u8]> = HashMap::new();
        for sp in &self.stack[idx..] {
            for (&pgno, bytes) in &sp.page_snapshots {
                restore.entry(pgno).or_insert_with(|| bytes.as_slice());
            }
        }

        for (pgno, bytes) in restore {
            match cache.get(pgno) {
                Some(page) => page.restore(bytes),
                None => {
                    let page = Arc::new(Page::from_bytes(pgno, bytes.to_vec()));
                    page.mark_dirty();
                    cache.put(page)?;
                }
            }
        }

        self.stack.truncate(idx + 1);
        Ok(true)
    }

    pub fn db_size_at(&self, name: &str) -> Option<u32> {
        self.stack.iter().find(|sp| sp.name() == name).map(|sp| sp.db_size_at_open())
    }

    pub fn journal_offset_at(&self, name: &str) -> Option<u64> {
        self.stack
            .iter()
            .find(|sp| sp.name() == name)
            .map(|sp| sp.journal_offset_at_open())
    }

    /// Clear every open savepoint (used on commit and full rollback).
    pub fn clear(&mut self) {
        self.stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(pgno: Pgno) -> Arc<Page> {
        Arc::new(Page::new(pgno, 8))
    }

    #[test]
    fn open_and_release_drops_nested_savepoints() {
        let mut stack = SavepointStack::new();
        stack.open("a", 10, 0);
        stack.open("b", 10, 28);
        stack.open("c", 10, 60);
        assert_eq!(stack.depth(), 3);

        assert!(stack.release("b"));
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.stack[0].name(), "a");
    }

    #[test]
    fn release_unknown_name_is_noop() {
        let mut stack = SavepointStack::new();
        stack.open("a", 10, 0);
        assert!(!stack.release("missing"));
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn rollback_to_restores_page_bytes_and_keeps_target() {
        let mut stack = SavepointStack::new();
        let p1 = page(1);
        p1.write(0, b"AAAAAAAA").unwrap();

        stack.open("a", 1, 0);
        stack.note_page_before_write(1, &p1);
        p1.write(0, b"BBBBBBBB").unwrap();

        stack.open("b", 1, 0);
        stack.note_page_before_write(1, &p1);
        p1.write(0, b"CCCCCCCC").unwrap();

        let mut cache = PageCache::new(10);
        cache.put(p1.clone()).unwrap();

        assert!(stack.rollback_to("a", &mut cache).unwrap());
        assert_eq!(p1.read(0, 8).unwrap(), b"AAAAAAAA");
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.stack[0].name(), "a");
    }

    #[test]
    fn rollback_to_unknown_name_is_noop() {
        let mut stack = SavepointStack::new();
        stack.open("a", 1, 0);
        let mut cache = PageCache::new(10);
        assert!(!stack.rollback_to("missing", &mut cache).unwrap());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn note_page_before_write_only_records_first_touch() {
        let mut stack = SavepointStack::new();
        let p1 = page(1);
        p1.write(0, b"AAAAAAAA").unwrap();

        stack.open("a", 1, 0);
        stack.note_page_before_write(1, &p1);
        p1.write(0, b"BBBBBBBB").unwrap();
        stack.note_page_before_write(1, &p1); // second touch, should not overwrite

        assert_eq!(stack.stack[0].snapshot_for(1).unwrap(), b"AAAAAAAA");
    }
}
