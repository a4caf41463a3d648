use crate::device::ConnectionMode;
use std::result::Result as StdResult;
use thiserror::Error;

/// Errors which can occur during image decoding, device tracking and communication.
#[derive(Debug, Error)]
pub enum Error {
    /// The firmware image text is malformed or does not fit into the board's flash.
    #[error("invalid hex image data on or near line {line}: {kind}")]
    Format { line: usize, kind: FormatError },

    /// The board family could not be determined or is not supported.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// A board did not reach the requested connection mode in time.
    #[error("timed out waiting for the board to enter {0} mode")]
    Timeout(ConnectionMode),

    /// The board with the given serial number could not be reached.
    #[error("device with serial number {0} is not available")]
    DeviceUnavailable(u32),

    /// An operation could not be performed because it was prohibited by safety checks (e.g.
    /// waiting for a board to become disconnected).
    #[error("invalid request")]
    InvalidRequest,

    /// No board matched the request.
    #[error("target not found")]
    TargetNotFound,

    /// The request was not specific enough and returned in multiple matches where only a single one
    /// is supported.
    #[error("too many matches")]
    TooManyMatches,

    /// The transport's report cannot carry a whole upload block.
    #[error("report of {available} bytes cannot hold a {needed} byte transaction")]
    ReportTooSmall { needed: usize, available: usize },

    /// An error occurred during the raw USB communication.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Reading a firmware file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The reason a line of an Intel HEX file was rejected.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FormatError {
    #[error("the 'end of file' record was not found")]
    MissingEndOfFile,

    #[error("the minimum line length is 11 characters")]
    TooShort,

    #[error("the line must start with a colon")]
    MissingColon,

    #[error("the record declares {declared} data bytes but the line holds {actual} characters")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("the line contains a character that is not a hexadecimal digit")]
    InvalidDigit,

    #[error("checksum failed (expected 0x{expected:02X}, found 0x{found:02X})")]
    Checksum { expected: u8, found: u8 },

    #[error("{len} bytes at offset 0x{offset:X} exceed the flash size of {flash_size} bytes")]
    ExceedsFlash {
        offset: u64,
        len: usize,
        flash_size: usize,
    },

    #[error("an extended address record must carry exactly two data bytes")]
    BadExtendedAddress,

    #[error("unsupported record type: {0:02X}")]
    UnsupportedRecord(u8),
}

/// Shorthand for a Result with the crate's own Error type.
pub type Result<T> = StdResult<T, Error>;
