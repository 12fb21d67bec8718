//! In-memory page objects.
//!
//! A `Page` owns a fixed-size byte buffer plus the small flag set and
//! refcount the cache and pager coordinate through. Pages are shared via
//! `Arc` between the cache and every outstanding caller handle, so a
//! page stays valid for as long as any caller holds a reference to it,
//! independent of cache eviction decisions.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::RwLock;

bitflags::bitflags! {
    /// Page flag set. Exactly one of CLEAN/DIRTY holds at any time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const CLEAN      = 0x01;
        const DIRTY      = 0x02;
        const WRITEABLE  = 0x04;
        const NEED_SYNC  = 0x08;
        const DONT_WRITE = 0x10;
    }
}

/// A single page of the database file, resident in the cache.
pub struct Page {
    pgno: Pgno,
    buf: RwLock<Vec<u8>>,
    flags: AtomicU8,
    refcount: AtomicI64,
}

impl Page {
    /// Allocate a new, zero-filled, clean page with refcount 1.
    pub fn new(pgno: Pgno, size: usize) -> Self {
        Page {
            pgno,
            buf: RwLock::new(vec![0u8; size]),
            flags: AtomicU8::new(PageFlags::CLEAN.bits()),
            refcount: AtomicI64::new(1),
        }
    }

    /// Build a page from bytes already read off disk (clean, refcount 1).
    pub fn from_bytes(pgno: Pgno, data: Vec<u8>) -> Self {
        Page {
            pgno,
            buf: RwLock::new(data),
            flags: AtomicU8::new(PageFlags::CLEAN.bits()),
            refcount: AtomicI64::new(1),
        }
    }

    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub fn size(&self) -> usize {
        self.buf.read().unwrap().len()
    }

    fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: PageFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    pub fn is_writeable(&self) -> bool {
        self.flags().contains(PageFlags::WRITEABLE)
    }

    /// Read `len` bytes starting at `offset`, bounds-checked, returned as
    /// an owned copy (never a borrowed view into the page buffer).
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let buf = self.buf.read().unwrap();
        if offset.checked_add(len).map_or(true, |end| end > buf.len()) {
            return Err(Error::with_message(ErrorCode::Misuse, "page read out of bounds"));
        }
        Ok(buf[offset..offset + len].to_vec())
    }

    /// Copy `bytes` into the buffer at `offset`, bounds-checked, and mark
    /// the page dirty + writeable.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut buf = self.buf.write().unwrap();
        if offset
            .checked_add(bytes.len())
            .map_or(true, |end| end > buf.len())
        {
            return Err(Error::with_message(ErrorCode::Misuse, "page write out of bounds"));
        }
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        drop(buf);
        self.set_flags(self.flags() | PageFlags::DIRTY | PageFlags::WRITEABLE);
        Ok(())
    }

    /// Fill the whole buffer with zeros and mark dirty + writeable.
    pub fn zero(&self) {
        let mut buf = self.buf.write().unwrap();
        buf.fill(0);
        drop(buf);
        self.set_flags(self.flags() | PageFlags::DIRTY | PageFlags::WRITEABLE);
    }

    /// Mark the page writeable without necessarily dirtying it (used once
    /// its original bytes have been journalled).
    pub fn mark_writeable(&self) {
        self.set_flags(self.flags() | PageFlags::WRITEABLE);
    }

    /// Mark the page dirty (original bytes already journalled by caller).
    pub fn mark_dirty(&self) {
        self.set_flags(self.flags() | PageFlags::DIRTY | PageFlags::WRITEABLE);
    }

    /// Reset to clean after a successful commit.
    pub fn mark_clean(&self) {
        let mut flags = self.flags();
        flags.remove(PageFlags::DIRTY);
        flags.remove(PageFlags::WRITEABLE);
        flags.remove(PageFlags::NEED_SYNC);
        flags.insert(PageFlags::CLEAN);
        self.set_flags(flags);
    }

    /// Overwrite the whole buffer (used to restore a savepoint/rollback
    /// snapshot) and mark the page dirty.
    pub fn restore(&self, data: &[u8]) {
        let mut buf = self.buf.write().unwrap();
        buf.clear();
        buf.extend_from_slice(data);
        drop(buf);
        self.set_flags(self.flags() | PageFlags::DIRTY | PageFlags::WRITEABLE);
    }

    /// Current refcount.
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment the refcount.
    pub fn reference(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the refcount, saturating at zero.
    pub fn unreference(&self) {
        let _ = self
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(if n > 0 { n - 1 } else { 0 })
            });
    }

    /// A deep copy of the current buffer, for use as a savepoint snapshot.
    pub fn clone_detached(&self) -> Vec<u8> {
        self.buf.read().unwrap().clone()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("pgno", &self.pgno)
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_clean_with_refcount_one() {
        let p = Page::new(1, 4096);
        assert!(!p.is_dirty());
        assert_eq!(p.refcount(), 1);
        assert_eq!(p.size(), 4096);
    }

    #[test]
    fn write_marks_dirty_and_writeable() {
        let p = Page::new(1, 16);
        p.write(0, b"hello").unwrap();
        assert!(p.is_dirty());
        assert!(p.is_writeable());
        assert_eq!(p.read(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn write_out_of_bounds_errors() {
        let p = Page::new(1, 16);
        assert!(p.write(10, b"0123456789").is_err());
    }

    #[test]
    fn unref_saturates_at_zero() {
        let p = Page::new(1, 16);
        p.unreference();
        p.unreference();
        assert_eq!(p.refcount(), 0);
    }

    #[test]
    fn clone_detached_is_independent() {
        let p = Page::new(1, 4);
        p.write(0, b"abcd").unwrap();
        let snapshot = p.clone_detached();
        p.write(0, b"wxyz").unwrap();
        assert_eq!(snapshot, b"abcd");
        assert_eq!(p.read(0, 4).unwrap(), b"wxyz");
    }

    #[test]
    fn mark_clean_resets_flags() {
        let p = Page::new(1, 4);
        p.write(0, b"data").unwrap();
        p.mark_clean();
        assert!(!p.is_dirty());
    }
}
