//! Node-to-node wire protocol.
//!
//! A frame is a big-endian `u32` length, then a `u16` type tag, then the
//! type-specific body. The length counts the tag and the body.

pub mod codec;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::fs::Mutation;
use crate::types::{Block, DiskId, DiskInfo, DiskPointer, GetBlockId, NodeId, PutBlockId};
use codec::{
    get_block, get_bool, get_count, get_file, get_pointer, get_str, get_u8, get_u16, get_u32,
    put_block, put_bool, put_count, put_file, put_pointer, put_str,
};

/// MAX_FRAME_LEN bounds a single frame; larger lengths are treated as malformed.
pub const MAX_FRAME_LEN: u32 = 1 << 30;

/// MAX_BLOCK_LEN is the largest block payload that still fits a write
/// request frame together with its ids and pointer.
pub const MAX_BLOCK_LEN: usize = (1 << 30) - (1 << 20);

pub const TAG_IAM: u16 = 1;
pub const TAG_SYNC_NODES: u16 = 2;
pub const TAG_WRITE_REQUEST: u16 = 3;
pub const TAG_WRITE_RESULT: u16 = 4;
pub const TAG_READ_REQUEST: u16 = 5;
pub const TAG_READ_RESULT: u16 = 6;
pub const TAG_BROADCAST: u16 = 7;

const BROADCAST_UPSERT: u8 = 0;
const BROADCAST_DELETE: u8 = 1;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown type tag {0}")]
    UnknownTag(u16),

    #[error("frame length {0} out of range")]
    FrameLength(u32),

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("invalid utf-8 string")]
    InvalidUtf8,

    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),

    #[error("invalid broadcast kind {0}")]
    InvalidKind(u8),

    #[error("invalid path {0:?}")]
    InvalidPath(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Payload is every message two nodes exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    IAm {
        node_id: NodeId,
        address: String,
        disks: Vec<DiskInfo>,
    },
    SyncNodes {
        nodes: Vec<(NodeId, String)>,
    },
    WriteRequest {
        caller: NodeId,
        put_id: PutBlockId,
        dest: DiskPointer,
        block: Block,
    },
    WriteResult {
        caller: NodeId,
        put_id: PutBlockId,
        dest: DiskPointer,
        result: Result<(), String>,
    },
    ReadRequest {
        caller: NodeId,
        get_id: GetBlockId,
        ptr: DiskPointer,
    },
    ReadResult {
        caller: NodeId,
        get_id: GetBlockId,
        ptr: DiskPointer,
        result: Result<Block, String>,
    },
    Broadcast(Mutation),
}

impl Payload {
    #[must_use]
    pub const fn tag(&self) -> u16 {
        match self {
            Self::IAm { .. } => TAG_IAM,
            Self::SyncNodes { .. } => TAG_SYNC_NODES,
            Self::WriteRequest { .. } => TAG_WRITE_REQUEST,
            Self::WriteResult { .. } => TAG_WRITE_RESULT,
            Self::ReadRequest { .. } => TAG_READ_REQUEST,
            Self::ReadResult { .. } => TAG_READ_RESULT,
            Self::Broadcast(_) => TAG_BROADCAST,
        }
    }

    /// `encode_frame` renders the payload as a complete length-prefixed frame.
    #[must_use]
    pub fn encode_frame(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(0);
        buf.put_u16(self.tag());
        self.encode_body(&mut buf);
        let len = u32::try_from(buf.len() - 4).unwrap_or(u32::MAX);
        buf[..4].copy_from_slice(&len.to_be_bytes());
        buf
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Self::IAm {
                node_id,
                address,
                disks,
            } => {
                put_str(buf, node_id.as_str());
                put_str(buf, address);
                put_count(buf, disks.len());
                for disk in disks {
                    put_str(buf, disk.disk_id.as_str());
                    buf.put_u32(disk.weight);
                }
            }
            Self::SyncNodes { nodes } => {
                put_count(buf, nodes.len());
                for (node_id, address) in nodes {
                    put_str(buf, node_id.as_str());
                    put_str(buf, address);
                }
            }
            Self::WriteRequest {
                caller,
                put_id,
                dest,
                block,
            } => {
                put_str(buf, caller.as_str());
                put_str(buf, put_id.as_str());
                put_pointer(buf, dest);
                put_block(buf, block);
            }
            Self::WriteResult {
                caller,
                put_id,
                dest,
                result,
            } => {
                put_str(buf, caller.as_str());
                put_str(buf, put_id.as_str());
                put_pointer(buf, dest);
                put_bool(buf, result.is_ok());
                put_str(buf, result.as_ref().err().map_or("", String::as_str));
            }
            Self::ReadRequest {
                caller,
                get_id,
                ptr,
            } => {
                put_str(buf, caller.as_str());
                put_str(buf, get_id.as_str());
                put_pointer(buf, ptr);
            }
            Self::ReadResult {
                caller,
                get_id,
                ptr,
                result,
            } => {
                put_str(buf, caller.as_str());
                put_str(buf, get_id.as_str());
                put_pointer(buf, ptr);
                put_bool(buf, result.is_ok());
                match result {
                    Ok(block) => put_block(buf, block),
                    Err(message) => put_str(buf, message),
                }
            }
            Self::Broadcast(mutation) => {
                let (kind, file) = match mutation {
                    Mutation::Upsert(file) => (BROADCAST_UPSERT, file),
                    Mutation::Delete(file) => (BROADCAST_DELETE, file),
                };
                buf.put_u8(kind);
                put_file(buf, file);
            }
        }
    }

    /// `decode` parses a frame body: the tag followed by the type-specific bytes.
    ///
    /// # Errors
    /// Returns an error for unknown tags, truncated input or trailing bytes.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let mut buf = frame;
        let tag = get_u16(&mut buf)?;
        let payload = match tag {
            TAG_IAM => {
                let node_id = NodeId(get_str(&mut buf)?);
                let address = get_str(&mut buf)?;
                let count = get_count(&mut buf, 8)?;
                let mut disks = Vec::with_capacity(count);
                for _ in 0..count {
                    let disk_id = DiskId(get_str(&mut buf)?);
                    let weight = get_u32(&mut buf)?;
                    disks.push(DiskInfo { disk_id, weight });
                }
                Self::IAm {
                    node_id,
                    address,
                    disks,
                }
            }
            TAG_SYNC_NODES => {
                let count = get_count(&mut buf, 8)?;
                let mut nodes = Vec::with_capacity(count);
                for _ in 0..count {
                    let node_id = NodeId(get_str(&mut buf)?);
                    let address = get_str(&mut buf)?;
                    nodes.push((node_id, address));
                }
                Self::SyncNodes { nodes }
            }
            TAG_WRITE_REQUEST => Self::WriteRequest {
                caller: NodeId(get_str(&mut buf)?),
                put_id: PutBlockId(get_str(&mut buf)?),
                dest: get_pointer(&mut buf)?,
                block: get_block(&mut buf)?,
            },
            TAG_WRITE_RESULT => {
                let caller = NodeId(get_str(&mut buf)?);
                let put_id = PutBlockId(get_str(&mut buf)?);
                let dest = get_pointer(&mut buf)?;
                let ok = get_bool(&mut buf)?;
                let message = get_str(&mut buf)?;
                Self::WriteResult {
                    caller,
                    put_id,
                    dest,
                    result: if ok { Ok(()) } else { Err(message) },
                }
            }
            TAG_READ_REQUEST => Self::ReadRequest {
                caller: NodeId(get_str(&mut buf)?),
                get_id: GetBlockId(get_str(&mut buf)?),
                ptr: get_pointer(&mut buf)?,
            },
            TAG_READ_RESULT => {
                let caller = NodeId(get_str(&mut buf)?);
                let get_id = GetBlockId(get_str(&mut buf)?);
                let ptr = get_pointer(&mut buf)?;
                let result = if get_bool(&mut buf)? {
                    Ok(get_block(&mut buf)?)
                } else {
                    Err(get_str(&mut buf)?)
                };
                Self::ReadResult {
                    caller,
                    get_id,
                    ptr,
                    result,
                }
            }
            TAG_BROADCAST => {
                let kind = get_u8(&mut buf)?;
                let file = get_file(&mut buf)?;
                match kind {
                    BROADCAST_UPSERT => Self::Broadcast(Mutation::Upsert(file)),
                    BROADCAST_DELETE => Self::Broadcast(Mutation::Delete(file)),
                    other => return Err(WireError::InvalidKind(other)),
                }
            }
            other => return Err(WireError::UnknownTag(other)),
        };
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes(buf.len()));
        }
        Ok(payload)
    }
}

/// `read_frame` reads one payload. A clean end of stream before the length
/// prefix yields `Ok(None)`.
///
/// # Errors
/// Returns an error on I/O failure, out-of-range lengths or undecodable bodies.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Payload>, WireError> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if !(2..=MAX_FRAME_LEN).contains(&len) {
        return Err(WireError::FrameLength(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Payload::decode(&body).map(Some)
}

/// `write_frame` writes one payload and flushes it.
///
/// # Errors
/// Returns an error if the underlying writer fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &Payload,
) -> Result<(), WireError> {
    let frame = payload.encode_frame();
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
