//! Error types for pcapmap

use std::io;
use thiserror::Error;

use crate::storage::SessionMode;

/// Result type for pcapmap operations
pub type Result<T> = std::result::Result<T, PcapMapError>;

/// Errors that can occur while storing or loading captures
///
/// Errors come in two tiers. Fatal errors (see [`PcapMapError::is_fatal`])
/// mean the contract with the OS broke while a mapping was being set up,
/// grown or torn down; the session cannot be used afterwards and the
/// caller's top-level handler is expected to terminate. Everything else is
/// reported to the caller, which decides whether to stop or carry on.
#[derive(Debug, Error)]
pub enum PcapMapError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Fewer bytes than a full file header were available
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes requested
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },

    /// Invalid capture file format (magic or version)
    #[error("Invalid capture format: {0}")]
    InvalidFormat(String),

    /// Clean end of the record stream at a record boundary
    #[error("End of record stream")]
    EndOfStream,

    /// A record runs past the end of the file
    #[error("Truncated record at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        /// Offset of the record header
        offset: u64,
        /// Bytes needed to complete the record
        needed: usize,
        /// Bytes left in the file
        available: usize,
    },

    /// Record header is malformed
    #[error("Invalid record at offset {offset}: {reason}")]
    InvalidRecord {
        /// Offset of the record header
        offset: u64,
        /// What was wrong with it
        reason: String,
    },

    /// Caller buffer cannot hold the record payload
    #[error("Buffer too small: record needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall {
        /// Captured length of the record
        needed: usize,
        /// Length of the caller buffer
        capacity: usize,
    },

    /// Record operation before the session was prepared
    #[error("Session not prepared for reading or writing")]
    NotPrepared,

    /// Session was already prepared
    #[error("Session already prepared")]
    AlreadyPrepared,

    /// Operation on a closed session
    #[error("Session closed")]
    SessionClosed,

    /// Operation does not match the session mode
    #[error("Wrong session mode: expected {expected}, session is {actual}")]
    WrongMode {
        /// Mode the operation needs
        expected: SessionMode,
        /// Mode the session was prepared with
        actual: SessionMode,
    },

    /// No engine registered under the identifier
    #[error("Unknown storage engine: {0}")]
    UnknownEngine(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Unrecoverable OS failure while mapping, growing or truncating
    #[error("Fatal: {op} failed: {source}")]
    Fatal {
        /// Operation that failed
        op: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Capture target is not a regular file
    #[error("Fatal: capture target is not a regular file: {0}")]
    NotRegularFile(String),

    /// Header write came up short
    #[error("Fatal: short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite {
        /// Bytes requested
        expected: usize,
        /// Bytes actually written
        actual: usize,
    },
}

impl PcapMapError {
    /// Whether the error leaves the session unusable
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal { .. } | Self::NotRegularFile(_) | Self::ShortWrite { .. }
        )
    }

    /// Whether the error marks a clean end of the record stream
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    pub(crate) fn fatal(op: &'static str, source: io::Error) -> Self {
        Self::Fatal { op, source }
    }
}
