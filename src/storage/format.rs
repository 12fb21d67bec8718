//! The 100-byte database file header: parse, validate, serialize.
//!
//! Field offsets and constraints are bit-exact with the SQLite 3 file
//! format (a 100-byte record at the start of page 1).

use crate::error::{Error, ErrorCode, Result};

/// Magic string every SQLite-3 database file begins with.
pub const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size in bytes of the on-disk header record.
pub const HEADER_SIZE: usize = 100;

/// `SQLITE_VERSION_NUMBER`-style stamp this engine reports as its own.
pub const ENGINE_VERSION_NUMBER: u32 = 3_045_000;

/// Parsed, validated database file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub page_size: u32,
    pub file_format_write_version: u8,
    pub file_format_read_version: u8,
    pub reserved_space: u8,
    pub max_embedded_payload_fraction: u8,
    pub min_embedded_payload_fraction: u8,
    pub leaf_payload_fraction: u8,
    pub file_change_counter: u32,
    pub database_size: u32,
    pub first_freelist_trunk_page: u32,
    pub total_freelist_pages: u32,
    pub schema_cookie: u32,
    pub schema_format_number: u32,
    pub default_page_cache_size: u32,
    pub largest_root_btree_page: u32,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum_mode: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub sqlite_version_number: u32,
}

/// Is `size` a legal SQLite page size (`1` meaning 65536, or a power of
/// two in `[512, 65536]`)?
pub fn is_valid_page_size(size: u32) -> bool {
    size == 1 || (512..=65536).contains(&size) && size.is_power_of_two()
}

/// Stored page-size field (`1` for 65536) to its logical byte count.
fn page_size_from_stored(stored: u16) -> u32 {
    if stored == 1 {
        65536
    } else {
        stored as u32
    }
}

/// Logical page size to its on-disk stored representation.
fn page_size_to_stored(size: u32) -> u16 {
    if size == 65536 {
        1
    } else {
        size as u16
    }
}

impl DatabaseHeader {
    /// Build a fresh header for a newly created database at `page_size`.
    pub fn construct_default(page_size: u32) -> Result<Self> {
        if !is_valid_page_size(page_size) {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("invalid page size {page_size}"),
            ));
        }

        Ok(DatabaseHeader {
            page_size,
            file_format_write_version: 1,
            file_format_read_version: 1,
            reserved_space: 0,
            max_embedded_payload_fraction: 64,
            min_embedded_payload_fraction: 32,
            leaf_payload_fraction: 32,
            file_change_counter: 0,
            database_size: 0,
            first_freelist_trunk_page: 0,
            total_freelist_pages: 0,
            schema_cookie: 0,
            schema_format_number: 4,
            default_page_cache_size: 0,
            largest_root_btree_page: 0,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum_mode: 0,
            application_id: 0,
            version_valid_for: 0,
            sqlite_version_number: ENGINE_VERSION_NUMBER,
        })
    }

    /// Parse and validate a 100-byte header record.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "header shorter than 100 bytes",
            ));
        }

        if &bytes[0..16] != MAGIC.as_slice() {
            return Err(Error::with_message(ErrorCode::NotADb, "bad magic"));
        }

        let stored_page_size = u16::from_be_bytes([bytes[16], bytes[17]]);
        let page_size = page_size_from_stored(stored_page_size);
        if !is_valid_page_size(page_size) {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("invalid page size {page_size} in header"),
            ));
        }

        let file_format_write_version = bytes[18];
        let file_format_read_version = bytes[19];
        if !(1..=2).contains(&file_format_write_version) || !(1..=2).contains(&file_format_read_version)
        {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "invalid file format version",
            ));
        }

        let max_embedded_payload_fraction = bytes[21];
        let min_embedded_payload_fraction = bytes[22];
        let leaf_payload_fraction = bytes[23];
        if max_embedded_payload_fraction != 64
            || min_embedded_payload_fraction != 32
            || leaf_payload_fraction != 32
        {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "invalid payload fraction bytes",
            ));
        }

        let text_encoding = u32::from_be_bytes(bytes[56..60].try_into().unwrap());
        if !(1..=3).contains(&text_encoding) {
            return Err(Error::with_message(ErrorCode::Corrupt, "invalid text encoding"));
        }

        let schema_format_number = u32::from_be_bytes(bytes[44..48].try_into().unwrap());
        if !(1..=4).contains(&schema_format_number) {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "invalid schema format number",
            ));
        }

        Ok(DatabaseHeader {
            page_size,
            file_format_write_version,
            file_format_read_version,
            reserved_space: bytes[20],
            max_embedded_payload_fraction,
            min_embedded_payload_fraction,
            leaf_payload_fraction,
            file_change_counter: u32::from_be_bytes(bytes[24..28].try_into().unwrap()),
            database_size: u32::from_be_bytes(bytes[28..32].try_into().unwrap()),
            first_freelist_trunk_page: u32::from_be_bytes(bytes[32..36].try_into().unwrap()),
            total_freelist_pages: u32::from_be_bytes(bytes[36..40].try_into().unwrap()),
            schema_cookie: u32::from_be_bytes(bytes[40..44].try_into().unwrap()),
            schema_format_number,
            default_page_cache_size: u32::from_be_bytes(bytes[48..52].try_into().unwrap()),
            largest_root_btree_page: u32::from_be_bytes(bytes[52..56].try_into().unwrap()),
            text_encoding,
            user_version: u32::from_be_bytes(bytes[60..64].try_into().unwrap()),
            incremental_vacuum_mode: u32::from_be_bytes(bytes[64..68].try_into().unwrap()),
            application_id: u32::from_be_bytes(bytes[68..72].try_into().unwrap()),
            version_valid_for: u32::from_be_bytes(bytes[92..96].try_into().unwrap()),
            sqlite_version_number: u32::from_be_bytes(bytes[96..100].try_into().unwrap()),
        })
    }

    /// Serialize to the 100-byte on-disk layout. Inverse of [`Self::parse`].
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..16].copy_from_slice(MAGIC.as_slice());
        out[16..18].copy_from_slice(&page_size_to_stored(self.page_size).to_be_bytes());
        out[18] = self.file_format_write_version;
        out[19] = self.file_format_read_version;
        out[20] = self.reserved_space;
        out[21] = self.max_embedded_payload_fraction;
        out[22] = self.min_embedded_payload_fraction;
        out[23] = self.leaf_payload_fraction;
        out[24..28].copy_from_slice(&self.file_change_counter.to_be_bytes());
        out[28..32].copy_from_slice(&self.database_size.to_be_bytes());
        out[32..36].copy_from_slice(&self.first_freelist_trunk_page.to_be_bytes());
        out[36..40].copy_from_slice(&self.total_freelist_pages.to_be_bytes());
        out[40..44].copy_from_slice(&self.schema_cookie.to_be_bytes());
        out[44..48].copy_from_slice(&self.schema_format_number.to_be_bytes());
        out[48..52].copy_from_slice(&self.default_page_cache_size.to_be_bytes());
        out[52..56].copy_from_slice(&self.largest_root_btree_page.to_be_bytes());
        out[56..60].copy_from_slice(&self.text_encoding.to_be_bytes());
        out[60..64].copy_from_slice(&self.user_version.to_be_bytes());
        out[64..68].copy_from_slice(&self.incremental_vacuum_mode.to_be_bytes());
        out[68..72].copy_from_slice(&self.application_id.to_be_bytes());
        // bytes 72..92 stay zero: reserved for expansion.
        out[92..96].copy_from_slice(&self.version_valid_for.to_be_bytes());
        out[96..100].copy_from_slice(&self.sqlite_version_number.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_round_trips() {
        let h = DatabaseHeader::construct_default(4096).unwrap();
        let bytes = h.serialize();
        let parsed = DatabaseHeader::parse(&bytes).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn page_size_one_means_65536() {
        let h = DatabaseHeader::construct_default(65536).unwrap();
        let bytes = h.serialize();
        assert_eq!(u16::from_be_bytes([bytes[16], bytes[17]]), 1);
        let parsed = DatabaseHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.page_size, 65536);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = DatabaseHeader::construct_default(4096).unwrap().serialize();
        bytes[0] = b'X';
        assert_eq!(
            DatabaseHeader::parse(&bytes).unwrap_err().code(),
            ErrorCode::NotADb
        );
    }

    #[test]
    fn rejects_bad_payload_fraction() {
        let mut bytes = DatabaseHeader::construct_default(4096).unwrap().serialize();
        bytes[21] = 63;
        assert_eq!(
            DatabaseHeader::parse(&bytes).unwrap_err().code(),
            ErrorCode::Corrupt
        );
    }

    #[test]
    fn rejects_invalid_page_size() {
        assert!(DatabaseHeader::construct_default(1000).is_err());
        assert!(DatabaseHeader::construct_default(512).is_ok());
    }

    #[test]
    fn valid_page_size_boundaries() {
        assert!(is_valid_page_size(512));
        assert!(is_valid_page_size(65536));
        assert!(is_valid_page_size(1));
        assert!(!is_valid_page_size(256));
        assert!(!is_valid_page_size(1000));
    }
}
