//! Primitive big-endian encoders and checked decoders.
//!
//! Strings and byte blobs are `u32 len` followed by the bytes, booleans are a
//! single byte and arrays are a `u32` count followed by the items.

use bytes::{Buf, BufMut, BytesMut};

use super::WireError;
use crate::fs::{File, FsPath};
use crate::types::{Block, BlockId, DiskId, DiskPointer, NodeId};

pub fn put_str(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(len_u32(value.len()));
    buf.put_slice(value);
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn put_count(buf: &mut BytesMut, count: usize) {
    buf.put_u32(len_u32(count));
}

pub fn put_pointer(buf: &mut BytesMut, ptr: &DiskPointer) {
    put_str(buf, ptr.node_id.as_str());
    put_str(buf, ptr.disk_id.as_str());
    put_str(buf, &ptr.file_name);
}

pub fn put_block(buf: &mut BytesMut, block: &Block) {
    put_str(buf, block.id.as_str());
    put_bytes(buf, &block.data);
}

/// `put_file` writes `(size, mode, modtime, BlockId, path)`.
pub fn put_file(buf: &mut BytesMut, file: &File) {
    buf.put_u64(file.size);
    buf.put_u32(file.mode);
    buf.put_i64(file.modtime);
    put_str(buf, file.block_id.as_str());
    put_str(buf, &file.path.to_string());
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn get_i64(buf: &mut &[u8]) -> Result<i64, WireError> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub fn get_bool(buf: &mut &[u8]) -> Result<bool, WireError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::InvalidBool(other)),
    }
}

pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

pub fn get_str(buf: &mut &[u8]) -> Result<String, WireError> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| WireError::InvalidUtf8)
}

/// `get_count` reads an array length and rejects counts the remaining bytes
/// cannot possibly hold.
pub fn get_count(buf: &mut &[u8], min_item_len: usize) -> Result<usize, WireError> {
    let count = get_u32(buf)? as usize;
    if count.saturating_mul(min_item_len.max(1)) > buf.remaining() {
        return Err(WireError::Truncated);
    }
    Ok(count)
}

pub fn get_pointer(buf: &mut &[u8]) -> Result<DiskPointer, WireError> {
    Ok(DiskPointer {
        node_id: NodeId(get_str(buf)?),
        disk_id: DiskId(get_str(buf)?),
        file_name: get_str(buf)?,
    })
}

pub fn get_block(buf: &mut &[u8]) -> Result<Block, WireError> {
    let id = BlockId(get_str(buf)?);
    let data = get_bytes(buf)?;
    Ok(Block { id, data })
}

pub fn get_file(buf: &mut &[u8]) -> Result<File, WireError> {
    let size = get_u64(buf)?;
    let mode = get_u32(buf)?;
    let modtime = get_i64(buf)?;
    let block_id = BlockId(get_str(buf)?);
    let raw_path = get_str(buf)?;
    let path = FsPath::parse(&raw_path).map_err(|_| WireError::InvalidPath(raw_path))?;
    Ok(File {
        path,
        size,
        mode,
        modtime,
        block_id,
    })
}

fn ensure(buf: &&[u8], len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
