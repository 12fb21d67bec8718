//! A pure-Rust SQLite-compatible pager core: page cache, rollback journal
//! and savepoint management.
//!
//! This crate implements the storage layer that sits directly on top of the
//! OS/VFS abstraction and directly below a B-tree/SQL layer: header parsing,
//! the page cache, the rollback journal, the pager state machine and nested
//! savepoints. The SQL parser, bytecode engine, B-tree layer and public
//! connection API are out of scope here.

#![allow(clippy::approx_constant)]

pub mod error;
pub mod os;
pub mod storage;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use os::vfs::{LockType, Vfs, VfsFile};
pub use storage::format::DatabaseHeader;
pub use storage::journal::Journal;
pub use storage::page::Page;
pub use storage::pager::{
    JournalMode, LockingMode, Pager, PagerOpenFlags, PagerState, PagerStats,
};
pub use storage::pcache::PageCache;
pub use storage::savepoint::Savepoint;
pub use types::{DbOffset, Pgno, MAX_PGNO};

#[cfg(unix)]
pub use os::unix::UnixVfs;

#[cfg(windows)]
pub use os::windows::WinVfs;
