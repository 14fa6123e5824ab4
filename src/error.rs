//! Error taxonomy and the last-error ledger.

use derive_more::Display;

use crate::config::ERROR_HISTORY_SIZE;

pub type Result<T> = core::result::Result<T, Error>;

/// Failure raised by a store operation.
///
/// Transport failures surface as [`Error::Generic`]; everything else names
/// the precondition or media condition that was violated. `NoBufferMemory`
/// carries the size the caller must provide to retry.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "generic failure")]
    Generic,
    #[display(fmt = "invalid parameter")]
    InvalidParam,
    #[display(fmt = "tag not found")]
    NotFound,
    #[display(fmt = "buffer too small, {} bytes required", required)]
    NoBufferMemory { required: usize },
    #[display(fmt = "data region exhausted")]
    NoMemorySpace,
    #[display(fmt = "index table full")]
    NoIndexSpace,
    #[display(fmt = "checksum mismatch")]
    CrcFailed,
    #[display(fmt = "structural corruption")]
    Corrupted,
    #[display(fmt = "incompatible version")]
    Version,
    #[display(fmt = "invalid stream handle")]
    InvalidHandle,
    #[display(fmt = "operation not allowed in current state")]
    InvalidState,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Generic => ErrorCode::Generic,
            Error::InvalidParam => ErrorCode::InvalidParam,
            Error::NotFound => ErrorCode::NotFound,
            Error::NoBufferMemory { .. } => ErrorCode::NoBufferMemory,
            Error::NoMemorySpace => ErrorCode::NoMemorySpace,
            Error::NoIndexSpace => ErrorCode::NoIndexSpace,
            Error::CrcFailed => ErrorCode::CrcFailed,
            Error::Corrupted => ErrorCode::Corrupted,
            Error::Version => ErrorCode::Version,
            Error::InvalidHandle => ErrorCode::InvalidHandle,
            Error::InvalidState => ErrorCode::InvalidState,
        }
    }
}

/// Stable code for each error kind, for hosts that log numeric codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    Generic = 1,
    InvalidParam = 2,
    NotFound = 3,
    NoBufferMemory = 4,
    NoMemorySpace = 5,
    NoIndexSpace = 6,
    CrcFailed = 7,
    Corrupted = 8,
    Version = 9,
    InvalidHandle = 10,
    InvalidState = 11,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::Generic => "generic failure",
            ErrorCode::InvalidParam => "invalid parameter",
            ErrorCode::NotFound => "tag not found",
            ErrorCode::NoBufferMemory => "buffer too small",
            ErrorCode::NoMemorySpace => "data region exhausted",
            ErrorCode::NoIndexSpace => "index table full",
            ErrorCode::CrcFailed => "checksum mismatch",
            ErrorCode::Corrupted => "structural corruption",
            ErrorCode::Version => "incompatible version",
            ErrorCode::InvalidHandle => "invalid stream handle",
            ErrorCode::InvalidState => "operation not allowed in current state",
        }
    }
}

/// Human-readable description of an error code.
pub fn error_string(code: ErrorCode) -> &'static str {
    code.as_str()
}

/// One recorded failure: what failed, on which tag, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub tag: u16,
    pub seconds: u32,
    pub millis: u32,
    pub op: &'static str,
}

/// Last-error record plus a bounded history ring.
///
/// Every failure path of the engine lands here before the error propagates
/// to the caller, so a host can reconstruct what went wrong after the fact
/// without a log sink attached.
#[derive(Debug)]
pub(crate) struct ErrorLedger {
    last: Option<ErrorRecord>,
    ring: [Option<ErrorRecord>; ERROR_HISTORY_SIZE],
    head: usize,
    recorded: u32,
}

impl ErrorLedger {
    pub(crate) const fn new() -> Self {
        Self {
            last: None,
            ring: [None; ERROR_HISTORY_SIZE],
            head: 0,
            recorded: 0,
        }
    }

    pub(crate) fn record(&mut self, rec: ErrorRecord) {
        self.last = Some(rec);
        self.ring[self.head] = Some(rec);
        self.head = (self.head + 1) % ERROR_HISTORY_SIZE;
        self.recorded = self.recorded.wrapping_add(1);
    }

    pub(crate) fn last(&self) -> Option<ErrorRecord> {
        self.last
    }

    pub(crate) fn clear(&mut self) {
        self.last = None;
        self.ring = [None; ERROR_HISTORY_SIZE];
        self.head = 0;
    }

    pub(crate) fn recorded(&self) -> u32 {
        self.recorded
    }

    /// Retained records, oldest first.
    pub(crate) fn history(&self) -> impl Iterator<Item = ErrorRecord> + '_ {
        let head = self.head;
        (0..ERROR_HISTORY_SIZE)
            .map(move |i| self.ring[(head + i) % ERROR_HISTORY_SIZE])
            .flatten()
    }
}
