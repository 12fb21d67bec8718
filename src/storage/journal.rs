//! Rollback-journal file: header, per-page original-data entries with a
//! checksum, apply-on-rollback, and the delete/truncate/persist finalise
//! modes.

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{OpenFlags, SyncFlags, Vfs, VfsFile};
use crate::types::Pgno;

/// Magic bytes a valid journal header begins with.
pub const JOURNAL_MAGIC: u32 = 0xD9D5_05F9;

/// Size in bytes of the journal header record.
pub const JOURNAL_HEADER_SIZE: usize = 28;

/// Default sector size recorded in a freshly created journal header.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// On-disk journal header: magic, entry count, nonce, pre-transaction
/// database size, sector size, page size, format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub magic: u32,
    pub entry_count: u32,
    pub nonce: u32,
    pub initial_db_size: u32,
    pub sector_size: u32,
    pub page_size: u32,
    pub format_version: u32,
}

impl JournalHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < JOURNAL_HEADER_SIZE {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "journal header shorter than 28 bytes",
            ));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != JOURNAL_MAGIC {
            return Err(Error::with_message(ErrorCode::Corrupt, "bad journal magic"));
        }
        Ok(JournalHeader {
            magic,
            entry_count: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            nonce: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            initial_db_size: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            sector_size: u32::from_be_bytes(bytes[16..20].try_into().unwrap()),
            page_size: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
            format_version: u32::from_be_bytes(bytes[24..28].try_into().unwrap()),
        })
    }

    pub fn to_bytes(self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut out = [0u8; JOURNAL_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.entry_count.to_be_bytes());
        out[8..12].copy_from_slice(&self.nonce.to_be_bytes());
        out[12..16].copy_from_slice(&self.initial_db_size.to_be_bytes());
        out[16..20].copy_from_slice(&self.sector_size.to_be_bytes());
        out[20..24].copy_from_slice(&self.page_size.to_be_bytes());
        out[24..28].copy_from_slice(&self.format_version.to_be_bytes());
        out
    }
}

/// Compute the entry checksum: XOR of `(pgno ^ nonce)` with every
/// big-endian 32-bit word of `data`, tail bytes zero-extended. Not a
/// cryptographic checksum — it only needs to catch accidental corruption.
pub fn checksum(pgno: Pgno, nonce: u32, data: &[u8]) -> u32 {
    let mut acc = pgno ^ nonce;
    let mut chunks = data.chunks_exact(4);
    for word in &mut chunks {
        acc ^= u32::from_be_bytes(word.try_into().unwrap());
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut padded = [0u8; 4];
        padded[..rem.len()].copy_from_slice(rem);
        acc ^= u32::from_be_bytes(padded);
    }
    acc
}

/// An open rollback-journal file and the bookkeeping needed to append
/// entries to it and later replay or finalise it.
pub struct Journal {
    file: Box<dyn VfsFile>,
    path: String,
    header: JournalHeader,
    write_offset: u64,
}

impl Journal {
    /// Create (truncating any existing file) and initialise a journal for
    /// a transaction starting from `initial_db_size` pages.
    pub fn create(
        vfs: &dyn Vfs,
        path: &str,
        page_size: u32,
        initial_db_size: u32,
    ) -> Result<Self> {
        let flags = OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::MAIN_JOURNAL;
        let file = vfs.open(Some(path), flags)?;
        file.truncate(0)?;

        let mut nonce_bytes = [0u8; 4];
        vfs.randomness(&mut nonce_bytes);
        let nonce = u32::from_be_bytes(nonce_bytes);

        let header = JournalHeader {
            magic: JOURNAL_MAGIC,
            entry_count: 0,
            nonce,
            initial_db_size,
            sector_size: DEFAULT_SECTOR_SIZE,
            page_size,
            format_version: 1,
        };

        file.write(&header.to_bytes(), 0)?;

        Ok(Journal {
            file,
            path: path.to_string(),
            header,
            write_offset: JOURNAL_HEADER_SIZE as u64,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count
    }

    pub fn nonce(&self) -> u32 {
        self.header.nonce
    }

    /// Current write offset within the entry region, in bytes from the
    /// start of the file. Used by savepoints to remember how much of the
    /// journal existed when they were opened.
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Append `[pgno(4 BE)][page data][checksum(4 BE)]` and bump the
    /// in-memory entry counter. `data` must be exactly one page.
    pub fn write_original(&mut self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if data.len() != self.header.page_size as usize {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "journal entry must be exactly one page",
            ));
        }

        let sum = checksum(pgno, self.header.nonce, data);

        let mut entry = Vec::with_capacity(4 + data.len() + 4);
        entry.extend_from_slice(&pgno.to_be_bytes());
        entry.extend_from_slice(data);
        entry.extend_from_slice(&sum.to_be_bytes());

        self.file.write(&entry, self.write_offset as i64)?;
        self.write_offset += entry.len() as u64;
        self.header.entry_count += 1;

        Ok(())
    }

    /// Flush the header (with the current entry count) and the entry
    /// region to durable storage. Must happen before any dirty page is
    /// written back to the database file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.write(&self.header.to_bytes(), 0)?;
        self.file.sync(SyncFlags::FULL)
    }

    /// Replay every entry back into the database file, verifying each
    /// checksum first. Aborts with `Corrupt` on the first mismatch,
    /// leaving the database partially restored (per the pager's
    /// documented failure semantics).
    pub fn apply(&self, db_file: &dyn VfsFile, page_size: u32) -> Result<()> {
        let entry_size = 4 + page_size as usize + 4;
        let mut offset = JOURNAL_HEADER_SIZE as u64;

        for _ in 0..self.header.entry_count {
            let mut entry = vec![0u8; entry_size];
            let n = self.file.read(&mut entry, offset as i64)?;
            if n < entry_size {
                break; // short journal; nothing more to replay
            }

            let pgno = u32::from_be_bytes(entry[0..4].try_into().unwrap());
            let data = &entry[4..4 + page_size as usize];
            let stored_checksum =
                u32::from_be_bytes(entry[4 + page_size as usize..entry_size].try_into().unwrap());

            if checksum(pgno, self.header.nonce, data) != stored_checksum {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "journal checksum mismatch during rollback",
                ));
            }

            let db_offset = (pgno as i64 - 1) * page_size as i64;
            db_file.write(data, db_offset)?;

            offset += entry_size as u64;
        }

        db_file.sync(SyncFlags::FULL)?;
        Ok(())
    }

    /// Finalise the journal per `mode`. `Off` never reaches here (the
    /// pager doesn't materialise a `Journal` for it). `Memory` is treated
    /// like `Delete`: this crate backs every journal with a real file
    /// rather than a separate in-RAM buffer, so "memory" mode only
    /// changes the pager's crash-durability story (sync still happens),
    /// not where the bytes are staged.
    pub fn finalize(self, vfs: &dyn Vfs, mode: super::pager::JournalMode) -> Result<()> {
        match mode {
            super::pager::JournalMode::Delete | super::pager::JournalMode::Memory => {
                drop(self.file);
                vfs.delete(&self.path, true)
            }
            super::pager::JournalMode::Truncate => {
                self.file.truncate(0)?;
                self.file.sync(SyncFlags::FULL)
            }
            super::pager::JournalMode::Persist => {
                // Zero just the magic so a crash recovery scan treats the
                // file as invalid without the cost of deleting/truncating.
                self.file.write(&[0u8; 4], 0)?;
                self.file.sync(SyncFlags::FULL)
            }
            super::pager::JournalMode::Off => Ok(()),
        }
    }

    /// Stand-alone validity check used by recovery tooling: file exists,
    /// is at least a header long, magic matches, and its page size
    /// matches the database's.
    pub fn is_valid(vfs: &dyn Vfs, path: &str, expected_page_size: u32) -> Result<bool> {
        use crate::os::vfs::AccessFlags;

        if !vfs.access(path, AccessFlags::EXISTS)? {
            return Ok(false);
        }

        let file = vfs.open(Some(path), OpenFlags::READONLY | OpenFlags::MAIN_JOURNAL)?;
        let size = file.file_size()?;
        if size < JOURNAL_HEADER_SIZE as i64 {
            return Ok(false);
        }

        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        file.read(&mut buf, 0)?;
        let header = match JournalHeader::from_bytes(&buf) {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };

        Ok(header.page_size == expected_page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::unix::UnixVfs;

    fn tmp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("sqlite_pager_journal_test_{name}_{}", std::process::id()))
            .to_string_lossy()
            .to_string()
    }

    #[test]
    fn header_round_trips() {
        let h = JournalHeader {
            magic: JOURNAL_MAGIC,
            entry_count: 3,
            nonce: 0xdead_beef,
            initial_db_size: 10,
            sector_size: 512,
            page_size: 4096,
            format_version: 1,
        };
        let bytes = h.to_bytes();
        let parsed = JournalHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn checksum_detects_single_byte_flip() {
        let data = vec![7u8; 4096];
        let sum = checksum(1, 42, &data);
        let mut corrupted = data.clone();
        corrupted[0] ^= 1;
        assert_ne!(checksum(1, 42, &corrupted), sum);
    }

    #[test]
    fn write_and_apply_round_trip() {
        let vfs = UnixVfs::new();
        let path = tmp_path("apply");
        let db_path = tmp_path("apply_db");

        let mut journal = Journal::create(&vfs, &path, 16, 1).unwrap();
        journal.write_original(1, &[1u8; 16]).unwrap();
        journal.write_original(2, &[2u8; 16]).unwrap();
        journal.sync().unwrap();

        let db_file = vfs
            .open(
                Some(&db_path),
                OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE,
            )
            .unwrap();
        db_file.write(&[9u8; 16], 0).unwrap();
        db_file.write(&[9u8; 16], 16).unwrap();

        journal.apply(db_file.as_ref(), 16).unwrap();

        let mut buf = [0u8; 16];
        db_file.read(&mut buf, 0).unwrap();
        assert_eq!(buf, [1u8; 16]);
        db_file.read(&mut buf, 16).unwrap();
        assert_eq!(buf, [2u8; 16]);

        vfs.delete(&path, false).unwrap();
    }

    #[test]
    fn corrupted_entry_fails_apply() {
        let vfs = UnixVfs::new();
        let path = tmp_path("corrupt");

        let mut journal = Journal::create(&vfs, &path, 16, 1).unwrap();
        journal.write_original(1, &[1u8; 16]).unwrap();
        journal.sync().unwrap();

        // Flip a byte inside the entry region, after the header.
        let file = vfs
            .open(Some(&path), OpenFlags::READWRITE)
            .unwrap();
        let mut byte = [0u8; 1];
        file.read(&mut byte, JOURNAL_HEADER_SIZE as i64 + 4).unwrap();
        byte[0] ^= 0xFF;
        file.write(&byte, JOURNAL_HEADER_SIZE as i64 + 4).unwrap();

        let db_path = tmp_path("corrupt_db");
        let db_file = vfs
            .open(
                Some(&db_path),
                OpenFlags::READWRITE | OpenFlags::CREATE | OpenFlags::DELETEONCLOSE,
            )
            .unwrap();
        db_file.write(&[0u8; 16], 0).unwrap();

        let err = journal.apply(db_file.as_ref(), 16).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Corrupt);

        vfs.delete(&path, false).unwrap();
    }
}
