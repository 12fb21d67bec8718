//! Error types and Result alias for the pager core.
//!
//! Mirrors SQLite's primary result-code taxonomy rather than inventing a
//! parallel one, since every layer above the pager (and every VFS call
//! below it) is expected to speak in these codes.

use std::fmt;
use std::io;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLite-style primary result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result
    Ok = 0,
    /// Generic SQL error or missing database
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// Callback routine requested an abort
    Abort = 4,
    /// The database file is locked
    Busy = 5,
    /// A table in the database is locked
    Locked = 6,
    /// A malloc() failed
    NoMem = 7,
    /// Attempt to write a readonly database
    ReadOnly = 8,
    /// Operation terminated by interrupt
    Interrupt = 9,
    /// Some kind of disk I/O error occurred
    IoErr = 10,
    /// The database disk image is malformed
    Corrupt = 11,
    /// Unknown opcode / object not found
    NotFound = 12,
    /// Insertion failed because the database is full
    Full = 13,
    /// Unable to open the database file
    CantOpen = 14,
    /// Database lock protocol error
    Protocol = 15,
    /// Internal use only
    Empty = 16,
    /// The database schema changed
    Schema = 17,
    /// String or blob exceeds size limit
    TooBig = 18,
    /// Abort due to constraint violation
    Constraint = 19,
    /// Data type mismatch
    Mismatch = 20,
    /// Library used incorrectly
    Misuse = 21,
    /// Uses OS features not supported on host
    NoLfs = 22,
    /// Authorization denied
    Auth = 23,
    /// Auxiliary database format error
    Format = 24,
    /// 2nd parameter to a bind function is out of range
    Range = 25,
    /// File opened that is not a database file
    NotADb = 26,
    /// Notifications from log
    Notice = 27,
    /// Warnings from log
    Warning = 28,
    /// sqlite3_step() has another row ready
    Row = 100,
    /// sqlite3_step() has finished executing
    Done = 101,
}

impl ErrorCode {
    /// The stand-alone description sqlite3_errstr() would produce.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::Error => "SQL logic error",
            ErrorCode::Internal => "internal error",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Abort => "query aborted",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "unknown operation",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Protocol => "locking protocol",
            ErrorCode::Empty => "empty",
            ErrorCode::Schema => "database schema has changed",
            ErrorCode::TooBig => "string or blob too big",
            ErrorCode::Constraint => "constraint failed",
            ErrorCode::Mismatch => "datatype mismatch",
            ErrorCode::Misuse => "bad parameter or other API misuse",
            ErrorCode::NoLfs => "large file support is disabled",
            ErrorCode::Auth => "authorization denied",
            ErrorCode::Format => "file format error",
            ErrorCode::Range => "column index out of range",
            ErrorCode::NotADb => "file is not a database",
            ErrorCode::Notice => "notification message",
            ErrorCode::Warning => "warning message",
            ErrorCode::Row => "another row available",
            ErrorCode::Done => "no more rows available",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate's single error type: a result code plus optional context.
#[derive(Debug)]
pub struct Error {
    code: ErrorCode,
    message: Option<String>,
    source: Option<io::Error>,
}

impl Error {
    /// Construct an error carrying only a code.
    pub fn new(code: ErrorCode) -> Self {
        Error {
            code,
            message: None,
            source: None,
        }
    }

    /// Construct an error with a code and a human-readable message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Error {
            code,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Construct an I/O error, preserving the originating `io::Error`.
    pub fn from_io(code: ErrorCode, source: io::Error) -> Self {
        Error {
            code,
            message: None,
            source: Some(source),
        }
    }

    /// The SQLite-style primary result code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message, falling back to the code's stock description.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.code.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{}: {}", self.message(), src),
            None => f.write_str(self.message()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::CantOpen,
            io::ErrorKind::PermissionDenied => ErrorCode::Perm,
            io::ErrorKind::AlreadyExists => ErrorCode::CantOpen,
            io::ErrorKind::WouldBlock => ErrorCode::Busy,
            io::ErrorKind::Interrupted => ErrorCode::Interrupt,
            _ => ErrorCode::IoErr,
        };
        Error::from_io(code, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errstr_matches_known_codes() {
        assert_eq!(ErrorCode::Ok.as_str(), "not an error");
        assert_eq!(ErrorCode::Busy.as_str(), "database is locked");
        assert_eq!(
            ErrorCode::Corrupt.as_str(),
            "database disk image is malformed"
        );
    }

    #[test]
    fn message_falls_back_to_code_string() {
        let e = Error::new(ErrorCode::ReadOnly);
        assert_eq!(e.message(), "attempt to write a readonly database");
    }

    #[test]
    fn with_message_overrides_default() {
        let e = Error::with_message(ErrorCode::Corrupt, "bad journal checksum");
        assert_eq!(e.message(), "bad journal checksum");
        assert_eq!(e.code(), ErrorCode::Corrupt);
    }
}
