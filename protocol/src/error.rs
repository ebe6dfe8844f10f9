use crate::{Command, FdType};
use thiserror::Error;

/// Errors while building, encoding or decoding a datagram
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// descriptor and metadata lists have different lengths
    #[error("{fds} descriptors but {metadata} metadata entries")]
    LengthMismatch { fds: usize, metadata: usize },

    /// descriptor roles don't match what the command requires
    #[error("unexpected descriptor types for {command}: {found:?}")]
    FdTypeMismatch { command: Command, found: Vec<FdType> },

    /// header announces a different number of descriptors than arrived
    #[error("header announces {expected} descriptors, {received} received")]
    FdCountMismatch { expected: usize, received: usize },

    /// too many descriptors for one datagram
    #[error("too many descriptors in one datagram: {0}")]
    TooManyFds(usize),

    /// payload too short for its header
    #[error("truncated payload, expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    /// bytes left over after the announced blobs
    #[error("{0} unexpected trailing bytes in payload")]
    TrailingBytes(usize),

    /// encoded datagram is over the size limit
    #[error("datagram of {0} bytes exceeds the size limit")]
    MessageTooLarge(usize),

    /// metadata is keyed by something other than a descriptor index
    #[error("invalid descriptor index in metadata: {0:?}")]
    InvalidMetadataIndex(String),

    /// descriptor metadata has no type
    #[error("descriptor metadata has no type")]
    MissingFdType,

    /// descriptor type not known
    #[error("unknown descriptor type: {0:?}")]
    UnknownFdType(String),

    /// command name not known
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// required parameter is absent
    #[error("missing parameter: {0}")]
    MissingParam(&'static str),

    /// parameter is present but can't be used
    #[error("invalid value for parameter {name}: {value:?}")]
    InvalidParam { name: &'static str, value: String },

    /// reply line is not in "ok: ..." or "fail: ..." form
    #[error("malformed service response: {0:?}")]
    MalformedResponse(String),

    /// json error
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
}
