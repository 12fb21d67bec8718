//! The pager: top-level coordinator of file I/O, the page cache, the
//! rollback journal and the savepoint stack. This is the only object a
//! caller above this crate needs to talk to.

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{LockType, OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::storage::format::{is_valid_page_size, DatabaseHeader, HEADER_SIZE};
use crate::storage::journal::Journal;
use crate::storage::page::Page;
use crate::storage::pcache::{PageCache, DEFAULT_CACHE_SIZE};
use crate::storage::savepoint::SavepointStack;
use crate::types::{Pgno, MAX_PGNO};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Default page size used when a caller doesn't request one explicitly.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

bitflags::bitflags! {
    /// Flags accepted by `Pager::open_with_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagerOpenFlags: u32 {
        /// Never create a rollback journal; writes are not crash-durable.
        const OMIT_JOURNAL = 0x0001;
        /// Keep the journal bytes in memory instead of on disk.
        const MEMORY       = 0x0002;
    }
}

/// How the journal is finalised on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Off,
    Memory,
}

/// Locking strategy for the lifetime of the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingMode {
    Normal,
    Exclusive,
}

/// The seven pager states. Lock sub-state is tracked separately as a
/// [`LockType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    Open,
    Reader,
    WriterLocked,
    WriterCachemod,
    WriterDbmod,
    WriterFinished,
    Error,
}

impl PagerState {
    fn is_writer(self) -> bool {
        matches!(
            self,
            PagerState::WriterLocked
                | PagerState::WriterCachemod
                | PagerState::WriterDbmod
                | PagerState::WriterFinished
        )
    }
}

/// Counters exposed to callers in lieu of a logging/metrics layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagerStats {
    pub n_read: u64,
    pub n_write: u64,
    pub n_hit: u64,
    pub n_miss: u64,
}

struct Inner {
    vfs: Arc<dyn Vfs>,
    db_file: Box<dyn VfsFile>,
    #[allow(dead_code)]
    path: String,
    journal_path: String,
    header: DatabaseHeader,
    page_size: u32,
    read_only: bool,
    state: PagerState,
    lock_state: LockType,
    cache: PageCache,
    journal: Option<Journal>,
    journal_mode: JournalMode,
    #[allow(dead_code)]
    locking_mode: LockingMode,
    original_db_size: u32,
    db_size: u32,
    savepoints: SavepointStack,
    journalled_pages: HashSet<Pgno>,
    stats: PagerStats,
    stored_error: Option<ErrorCode>,
}

/// Coordinates a single database file, its rollback journal and its page
/// cache. Thread-safe: every public method takes the internal lock.
pub struct Pager {
    inner: Mutex<Inner>,
}

impl Pager {
    /// Open (or create) a database file with the default page size and
    /// cache capacity.
    pub fn open(vfs: Arc<dyn Vfs>, path: &str, read_only: bool) -> Result<Self> {
        Self::open_with_flags(vfs, path, read_only, DEFAULT_PAGE_SIZE, PagerOpenFlags::empty())
    }

    /// Open with an explicit page size for newly created databases. An
    /// existing database's own header page size always wins.
    pub fn open_with_page_size(
        vfs: Arc<dyn Vfs>,
        path: &str,
        read_only: bool,
        page_size: u32,
    ) -> Result<Self> {
        Self::open_with_flags(vfs, path, read_only, page_size, PagerOpenFlags::empty())
    }

    pub fn open_with_flags(
        vfs: Arc<dyn Vfs>,
        path: &str,
        read_only: bool,
        page_size: u32,
        flags: PagerOpenFlags,
    ) -> Result<Self> {
        Self::open_with_config(vfs, path, read_only, page_size, DEFAULT_CACHE_SIZE, flags)
    }

    /// Open with full control over page size, cache capacity (page count)
    /// and open flags. All other `open*` constructors delegate here.
    pub fn open_with_config(
        vfs: Arc<dyn Vfs>,
        path: &str,
        read_only: bool,
        page_size: u32,
        cache_capacity: usize,
        flags: PagerOpenFlags,
    ) -> Result<Self> {
        if !is_valid_page_size(page_size) {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("invalid page size {page_size}"),
            ));
        }

        let open_flags = if read_only {
            OpenFlags::READONLY | OpenFlags::MAIN_DB
        } else {
            OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_DB
        };
        let db_file = vfs.open(Some(path), open_flags)?;
        let file_size = db_file.file_size()?;

        let (header, adopted_page_size) = if file_size == 0 {
            if read_only {
                return Err(Error::with_message(
                    ErrorCode::CantOpen,
                    "cannot initialise an empty database read-only",
                ));
            }
            let mut header = DatabaseHeader::construct_default(page_size)?;
            header.database_size = 1;
            let mut first_page = vec![0u8; page_size as usize];
            first_page[..HEADER_SIZE].copy_from_slice(&header.serialize());
            db_file.write(&first_page, 0)?;
            db_file.sync(SyncFlags::FULL)?;
            (header, page_size)
        } else {
            if file_size < HEADER_SIZE as i64 {
                return Err(Error::with_message(ErrorCode::NotADb, "file too short for a header"));
            }
            let mut buf = [0u8; HEADER_SIZE];
            db_file.read(&mut buf, 0)?;
            let header = DatabaseHeader::parse(&buf)?;
            let adopted = header.page_size;
            (header, adopted)
        };

        let db_size = if header.database_size > 0 {
            header.database_size
        } else {
            (file_size as u64 / adopted_page_size as u64) as u32
        };

        let journal_mode = if flags.contains(PagerOpenFlags::MEMORY) {
            JournalMode::Memory
        } else if flags.contains(PagerOpenFlags::OMIT_JOURNAL) {
            JournalMode::Off
        } else {
            JournalMode::Delete
        };

        let inner = Inner {
            vfs,
            db_file,
            path: path.to_string(),
            journal_path: format!("{path}-journal"),
            header,
            page_size: adopted_page_size,
            read_only,
            state: PagerState::Open,
            lock_state: LockType::None,
            cache: PageCache::new(cache_capacity),
            journal: None,
            journal_mode,
            locking_mode: LockingMode::Normal,
            original_db_size: db_size,
            db_size,
            savepoints: SavepointStack::new(),
            journalled_pages: HashSet::new(),
            stats: PagerStats::default(),
            stored_error: None,
        };

        Ok(Pager {
            inner: Mutex::new(inner),
        })
    }

    /// Roll back any in-flight transaction and release the file handles.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_writer() {
            Self::do_rollback(&mut inner)?;
        }
        Ok(())
    }

    pub fn get(&self, pgno: Pgno) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_not_errored(&inner)?;

        if pgno == 0 || pgno > MAX_PGNO {
            return Err(Error::with_message(ErrorCode::Corrupt, "invalid page number"));
        }

        if let Some(page) = inner.cache.get(pgno) {
            page.reference();
            inner.stats.n_hit += 1;
            return Ok(page);
        }
        inner.stats.n_miss += 1;

        if inner.state == PagerState::Open {
            inner.db_file.lock(LockType::Shared)?;
            inner.lock_state = LockType::Shared;
            inner.state = PagerState::Reader;
        }

        let page_size = inner.page_size as usize;
        let mut buf = vec![0u8; page_size];
        let offset = (pgno as i64 - 1) * page_size as i64;
        if let Err(e) = inner.db_file.read(&mut buf, offset) {
            inner.state = PagerState::Error;
            inner.stored_error = Some(e.code());
            return Err(e);
        }
        inner.stats.n_read += 1;

        if pgno > inner.db_size {
            inner.db_size = pgno;
        }

        let page = Arc::new(Page::from_bytes(pgno, buf));
        if let Err(e) = inner.cache.put(page.clone()) {
            return Err(e);
        }

        Ok(page)
    }

    pub fn put(&self, page: &Arc<Page>) {
        page.unreference();
    }

    /// Prepare `page` for in-place mutation: begins a write transaction if
    /// none is active, journals the page's pre-modification bytes on its
    /// first touch this transaction, and marks it writeable + dirty.
    pub fn write(&self, page: &Arc<Page>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_not_errored(&inner)?;

        if inner.read_only {
            return Err(Error::with_message(ErrorCode::ReadOnly, "pager is read-only"));
        }

        if inner.state == PagerState::Open || inner.state == PagerState::Reader {
            inner.db_file.lock(LockType::Reserved)?;
            inner.lock_state = LockType::Reserved;
            inner.original_db_size = inner.db_size;
            inner.state = PagerState::WriterLocked;
        } else if !inner.state.is_writer() {
            return Err(Error::with_message(ErrorCode::Misuse, "pager not in a writable state"));
        }

        let pgno = page.pgno();

        // Every open savepoint needs its own first-touch snapshot of this
        // page, independent of whether the page was already journalled
        // earlier in the transaction: `journalled_pages` is transaction-
        // scoped, but a savepoint may have been opened after that first
        // journal entry and still needs to see the page's pre-write bytes
        // as of its own epoch. `Savepoint::note_page_before_write` already
        // de-dupes per page, so this is safe to call on every `write()`.
        inner.savepoints.note_page_before_write(pgno, page);

        if !inner.journalled_pages.contains(&pgno) {
            if inner.journal.is_none() && !matches!(inner.journal_mode, JournalMode::Off) {
                let journal_path = inner.journal_path.clone();
                let journal = Journal::create(
                    inner.vfs.as_ref(),
                    &journal_path,
                    inner.page_size,
                    inner.original_db_size,
                )?;
                inner.journal = Some(journal);
            }

            let original_bytes = page.clone_detached();
            if let Some(journal) = inner.journal.as_mut() {
                journal.write_original(pgno, &original_bytes)?;
                journal.sync()?;
            }
            inner.journalled_pages.insert(pgno);

            if inner.state == PagerState::WriterLocked {
                inner.state = PagerState::WriterCachemod;
            }
        }

        page.mark_writeable();
        page.mark_dirty();
        Ok(())
    }

    /// Durably apply every dirty page, finalise the journal, and return to
    /// the `open` state.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_not_errored(&inner)?;

        if !inner.state.is_writer() {
            return Err(Error::with_message(ErrorCode::Misuse, "no active write transaction"));
        }

        inner.state = PagerState::WriterDbmod;
        let page_size = inner.page_size as i64;
        let dirty = inner.cache.dirty_pages();

        for page in &dirty {
            let bytes = page.read(0, page.size())?;
            let offset = (page.pgno() as i64 - 1) * page_size;
            if let Err(e) = inner.db_file.write(&bytes, offset) {
                inner.state = PagerState::Error;
                inner.stored_error = Some(e.code());
                return Err(e);
            }
            inner.stats.n_write += 1;
        }

        if let Err(e) = inner.db_file.sync(SyncFlags::FULL) {
            inner.state = PagerState::Error;
            inner.stored_error = Some(e.code());
            return Err(e);
        }

        if !dirty.is_empty() {
            inner.header.database_size = inner.db_size;
            inner.header.file_change_counter = inner.header.file_change_counter.wrapping_add(1);
            let header_bytes = inner.header.serialize();
            if let Err(e) = inner.db_file.write(&header_bytes, 0) {
                inner.state = PagerState::Error;
                inner.stored_error = Some(e.code());
                return Err(e);
            }
            inner.db_file.sync(SyncFlags::FULL)?;
        }

        if let Some(journal) = inner.journal.take() {
            let mode = inner.journal_mode;
            let vfs = inner.vfs.clone();
            journal.finalize(vfs.as_ref(), mode)?;
        }
        inner.journalled_pages.clear();

        inner.cache.make_all_clean();
        inner.savepoints.clear();

        inner.state = PagerState::WriterFinished;
        inner.db_file.unlock(LockType::None)?;
        inner.lock_state = LockType::None;
        inner.state = PagerState::Open;

        Ok(())
    }

    /// Replay the journal back into the database file and return to the
    /// pre-transaction state.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_writer() {
            return Err(Error::with_message(ErrorCode::Misuse, "no active write transaction"));
        }
        Self::do_rollback(&mut inner)
    }

    fn do_rollback(inner: &mut Inner) -> Result<()> {
        if let Some(journal) = inner.journal.take() {
            if let Err(e) = journal.apply(inner.db_file.as_ref(), inner.page_size) {
                inner.state = PagerState::Error;
                inner.stored_error = Some(e.code());
                return Err(e);
            }
            inner.vfs.delete(&inner.journal_path, false)?;
        }

        inner.cache.clear();
        inner.db_size = inner.original_db_size;
        inner.savepoints.clear();
        inner.journalled_pages.clear();

        inner.db_file.unlock(LockType::None)?;
        inner.lock_state = LockType::None;
        inner.state = PagerState::Open;
        Ok(())
    }

    pub fn savepoint(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_writer() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "savepoint requires an active write transaction",
            ));
        }
        if name.is_empty() {
            return Err(Error::with_message(ErrorCode::Misuse, "savepoint name must not be empty"));
        }
        if inner.savepoints.db_size_at(name).is_some() {
            return Err(Error::with_message(ErrorCode::Misuse, "duplicate savepoint name"));
        }

        let offset = inner
            .journal
            .as_ref()
            .map(|j| j.write_offset())
            .unwrap_or(crate::storage::journal::JOURNAL_HEADER_SIZE as u64);
        let db_size = inner.db_size;
        inner.savepoints.open(name, db_size, offset);
        Ok(())
    }

    pub fn release(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_writer() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "savepoint release requires an active write transaction",
            ));
        }
        if !inner.savepoints.release(name) {
            return Err(Error::with_message(ErrorCode::NotFound, "unknown savepoint"));
        }
        Ok(())
    }

    pub fn rollback_to(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_writer() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "savepoint rollback requires an active write transaction",
            ));
        }
        let db_size = inner.savepoints.db_size_at(name);
        let cache = &mut inner.cache;
        let found = inner.savepoints.rollback_to(name, cache)?;
        if !found {
            return Err(Error::with_message(ErrorCode::NotFound, "unknown savepoint"));
        }
        if let Some(size) = db_size {
            inner.db_size = size;
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.inner.lock().unwrap().page_size
    }

    pub fn page_count(&self) -> u32 {
        self.inner.lock().unwrap().db_size
    }

    pub fn cache_capacity(&self) -> usize {
        self.inner.lock().unwrap().cache.capacity()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.lock().unwrap().read_only
    }

    pub fn get_header(&self) -> DatabaseHeader {
        self.inner.lock().unwrap().header.clone()
    }

    pub fn get_transaction_state(&self) -> PagerState {
        self.inner.lock().unwrap().state
    }

    pub fn get_lock_state(&self) -> LockType {
        self.inner.lock().unwrap().lock_state
    }

    pub fn set_journal_mode(&self, mode: JournalMode) {
        self.inner.lock().unwrap().journal_mode = mode;
    }

    pub fn stats(&self) -> PagerStats {
        self.inner.lock().unwrap().stats
    }

    fn check_not_errored(inner: &Inner) -> Result<()> {
        if inner.state == PagerState::Error {
            return Err(Error::with_message(
                inner.stored_error.unwrap_or(ErrorCode::IoErr),
                "pager is in the error state; rollback required",
            ));
        }
        Ok(())
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state.is_writer() {
                let _ = Self::do_rollback(&mut inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::unix::UnixVfs;

    fn tmp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("sqlite_pager_pager_test_{name}_{}", std::process::id()))
            .to_string_lossy()
            .to_string()
    }

    fn fresh_pager(name: &str) -> (Pager, String) {
        let path = tmp_path(name);
        let vfs: Arc<dyn Vfs> = Arc::new(UnixVfs::new());
        let pager = Pager::open_with_page_size(vfs, &path, false, 512).unwrap();
        (pager, path)
    }

    #[test]
    fn open_fresh_creates_default_header() {
        let (pager, path) = fresh_pager("open_fresh");
        assert_eq!(pager.page_size(), 512);
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.get_transaction_state(), PagerState::Open);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_commit_reopen_is_durable() {
        let (pager, path) = fresh_pager("write_commit");
        {
            let page = pager.get(1).unwrap();
            pager.write(&page).unwrap();
            page.write(0, b"hello").unwrap();
            pager.commit().unwrap();
        }
        drop(pager);

        let vfs: Arc<dyn Vfs> = Arc::new(UnixVfs::new());
        let reopened = Pager::open_with_page_size(vfs, &path, false, 512).unwrap();
        let page = reopened.get(1).unwrap();
        assert_eq!(&page.read(0, 5).unwrap(), b"hello");
        std::fs::remove_file(&path).ok();
        std::fs::remove_file(format!("{path}-journal")).ok();
    }

    #[test]
    fn write_rollback_restores_original_bytes() {
        let (pager, path) = fresh_pager("write_rollback");
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        page.write(100, b"scratch").unwrap();
        pager.rollback().unwrap();

        assert_eq!(pager.get_transaction_state(), PagerState::Open);
        let reread = pager.get(1).unwrap();
        assert_eq!(reread.read(100, 7).unwrap(), vec![0u8; 7]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn nested_savepoints_roll_back_independently() {
        let (pager, path) = fresh_pager("savepoints");
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        page.write(0, b"AAAA").unwrap();

        pager.savepoint("outer").unwrap();
        pager.write(&page).unwrap();
        page.write(0, b"BBBB").unwrap();

        pager.savepoint("inner").unwrap();
        pager.write(&page).unwrap();
        page.write(0, b"CCCC").unwrap();

        pager.rollback_to("outer").unwrap();
        assert_eq!(page.read(0, 4).unwrap(), b"BBBB");

        pager.commit().unwrap();
        std::fs::remove_file(&path).ok();
        std::fs::remove_file(format!("{path}-journal")).ok();
    }

    #[test]
    fn commit_without_transaction_errors() {
        let (pager, path) = fresh_pager("commit_no_tx");
        let err = pager.commit().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn get_rejects_page_zero() {
        let (pager, path) = fresh_pager("page_zero");
        let err = pager.get(0).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Corrupt);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn duplicate_savepoint_name_errors() {
        let (pager, path) = fresh_pager("dup_savepoint");
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        pager.savepoint("s1").unwrap();
        let err = pager.savepoint("s1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);
        pager.rollback().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn cache_full_rejects_get_with_no_evictable_page() {
        let path = tmp_path("cache_full");
        let vfs: Arc<dyn Vfs> = Arc::new(UnixVfs::new());
        let pager =
            Pager::open_with_config(vfs, &path, false, 512, 5, PagerOpenFlags::empty()).unwrap();

        let mut pages = Vec::new();
        for pgno in 1..=5u32 {
            let page = pager.get(pgno).unwrap();
            pager.write(&page).unwrap();
            page.write(0, &[pgno as u8]).unwrap();
            pager.put(&page);
            pages.push(page);
        }
        assert_eq!(pager.cache_capacity(), 5);

        let err = pager.get(6).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Full);

        pager.rollback().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
