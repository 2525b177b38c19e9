//! Error taxonomy carried on reply channels.

use thiserror::Error;

use crate::types::NodeId;

/// BlockError is the outcome of a failed block put or get.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// The distributor has no candidate disks.
    #[error("no disks available for placement")]
    NoDisks,

    /// A replica lives on a node without a live connection.
    #[error("no connection to node {0}")]
    NoRoute(NodeId),

    /// A local disk executor failed or is missing.
    #[error("disk i/o: {0}")]
    Io(String),

    /// A peer reported a failure for a forwarded request.
    #[error("remote: {0}")]
    Remote(String),

    /// The block does not fit in a single wire frame.
    #[error("block of {0} bytes exceeds the {max} byte limit", max = crate::wire::MAX_BLOCK_LEN)]
    TooLarge(usize),

    /// The manager stopped before replying.
    #[error("node is shutting down")]
    Stopped,
}

/// FsError is returned by filesystem index operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("parent directory missing: {0}")]
    MissingParent(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid open flags: {0}")]
    InvalidFlags(&'static str),

    #[error("seek to a negative position")]
    NegativeSeek,

    #[error("write would grow the file past {max} bytes", max = crate::wire::MAX_BLOCK_LEN)]
    FileTooLarge,

    #[error("negative readdir count")]
    NegativeCount,

    #[error("unknown file handle")]
    BadHandle,

    #[error("handle not opened for reading")]
    NotReadable,

    #[error("handle not opened for writing")]
    NotWritable,

    #[error("block get failed: {0}")]
    BlockGet(BlockError),

    #[error("block put failed: {0}")]
    BlockPut(BlockError),

    #[error("persisting file index: {0}")]
    Persist(String),

    #[error("filesystem is shutting down")]
    Stopped,
}

pub type FsResult<T> = Result<T, FsError>;
