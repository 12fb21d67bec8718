//! End-to-end pager scenarios, run against the real Unix VFS and real
//! temp-file databases.

use std::sync::Arc;

use sqlite_pager::os::unix::UnixVfs;
use sqlite_pager::os::vfs::Vfs;
use sqlite_pager::{DatabaseHeader, ErrorCode, Pager};
use tempfile::tempdir;

fn vfs() -> Arc<dyn Vfs> {
    Arc::new(UnixVfs::new())
}

fn journal_path(db_path: &str) -> String {
    format!("{db_path}-journal")
}

#[test]
fn open_fresh_creates_minimal_valid_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.db");
    let path_str = path.to_str().unwrap();

    let pager = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();
    assert_eq!(pager.page_count(), 1);
    let header = pager.get_header();
    assert_eq!(header.database_size, 1);
    assert_eq!(header.file_change_counter, 0);
    drop(pager);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 4096);
    let reparsed = DatabaseHeader::parse(&bytes[..100]).unwrap();
    assert_eq!(reparsed, header);
}

#[test]
fn write_commit_reopen_is_durable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wcr.db");
    let path_str = path.to_str().unwrap();

    {
        let pager = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        page.write(100, b"Hello, World!").unwrap();
        pager.commit().unwrap();
    }

    let reopened = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();
    let page = reopened.get(1).unwrap();
    assert_eq!(&page.read(100, 13).unwrap(), b"Hello, World!");
}

#[test]
fn write_rollback_restores_original_and_removes_journal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wrr.db");
    let path_str = path.to_str().unwrap();

    {
        let pager = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        page.write(100, b"Original").unwrap();
        pager.commit().unwrap();
    }

    let pager = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();
    let page = pager.get(1).unwrap();
    pager.write(&page).unwrap();
    page.write(100, b"Modified").unwrap();
    pager.rollback().unwrap();

    let reread = pager.get(1).unwrap();
    assert_eq!(&reread.read(100, 8).unwrap(), b"Original");
    assert!(!std::path::Path::new(&journal_path(path_str)).exists());
}

#[test]
fn nested_savepoints_roll_back_independently() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested_sp.db");
    let path_str = path.to_str().unwrap();

    let pager = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();

    {
        let page = pager.get(1).unwrap();
        pager.write(&page).unwrap();
        page.write(0, &[0x11]).unwrap();
        pager.commit().unwrap();
    }

    let page = pager.get(1).unwrap();
    pager.write(&page).unwrap();
    page.write(0, &[0x22]).unwrap();

    pager.savepoint("sp1").unwrap();
    pager.write(&page).unwrap();
    page.write(0, &[0x33]).unwrap();

    pager.savepoint("sp2").unwrap();
    pager.write(&page).unwrap();
    page.write(0, &[0x44]).unwrap();

    pager.rollback_to("sp2").unwrap();
    assert_eq!(page.read(0, 1).unwrap(), vec![0x33]);

    pager.rollback_to("sp1").unwrap();
    assert_eq!(page.read(0, 1).unwrap(), vec![0x22]);

    pager.commit().unwrap();
}

#[test]
fn corrupt_journal_is_detected_on_rollback() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.db");
    let path_str = path.to_str().unwrap();
    let jpath = journal_path(path_str);

    let pager = Pager::open_with_page_size(vfs(), path_str, false, 4096).unwrap();
    let page = pager.get(1).unwrap();
    pager.write(&page).unwrap();
    page.write(0, b"scratch-data").unwrap();

    // Simulate a crash: the transaction's journal is on disk and synced,
    // but we never call commit/rollback on `pager` — drop it without
    // releasing its lock bookkeeping, then corrupt the journal and
    // recover via a fresh pager instance... since this pager owns the
    // only file handle, flip a byte directly through the filesystem
    // before asking the same pager to roll back.
    let mut bytes = std::fs::read(&jpath).unwrap();
    let entry_region_start = 28; // JOURNAL_HEADER_SIZE
    bytes[entry_region_start + 4] ^= 0xFF; // inside the page-data region
    std::fs::write(&jpath, &bytes).unwrap();

    let err = pager.rollback().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Corrupt);
}

#[test]
fn cache_full_rejects_get_when_no_page_is_evictable() {
    use sqlite_pager::PagerOpenFlags;

    let dir = tempdir().unwrap();
    let path = dir.path().join("cache_full.db");
    let path_str = path.to_str().unwrap();

    let pager =
        Pager::open_with_config(vfs(), path_str, false, 512, 5, PagerOpenFlags::empty()).unwrap();

    let mut pages = Vec::new();
    for pgno in 1..=5u32 {
        let page = pager.get(pgno).unwrap();
        pager.write(&page).unwrap();
        page.write(0, &[pgno as u8]).unwrap();
        pager.put(&page);
        pages.push(page);
    }

    let err = pager.get(6).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Full);

    pager.rollback().unwrap();
}
