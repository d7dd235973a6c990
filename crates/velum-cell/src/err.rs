//! Define error types for the velum-cell crate.

use thiserror::Error;

/// An error produced while trying to decode an object from bytes.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum BytesError {
    /// The object was truncated, or not fully present in the input.
    #[error("Object truncated (or not fully present)")]
    Truncated,
    /// There were extraneous bytes after the end of the object.
    #[error("Extra bytes at end of object")]
    ExtraneousBytes,
    /// The object was malformed in some way other than truncation.
    #[error("Bad object: {0}")]
    BadMessage(&'static str),
}

/// An error type for the velum-cell crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while decoding an object.
    #[error("Error while parsing {parsed}")]
    BytesErr {
        /// The error that occurred.
        #[source]
        err: BytesError,
        /// The thing that was being parsed.
        parsed: &'static str,
    },
    /// Tried to construct a message that can't be represented in a cell.
    ///
    /// This is likely to be a bug in the calling code.
    #[error("Message can't be represented in a cell: {0}")]
    CantEncode(&'static str),
    /// Protocol violation at the channel level.
    #[error("Channel protocol violation: {0}")]
    ChanProto(String),
    /// Protocol violation at the circuit level.
    #[error("Circuit protocol violation: {0}")]
    CircProto(String),
    /// Tried to make or use a stream to an invalid destination address.
    #[error("Invalid stream target address")]
    BadStreamAddress,
}

impl Error {
    /// Wrap a [`BytesError`] as an `Error`, recording what we were parsing.
    pub fn from_bytes_err(err: BytesError, parsed: &'static str) -> Self {
        Error::BytesErr { err, parsed }
    }
}
