//! Binary snapshot of the filesystem index.
//!
//! The file is a sequence of entries, each a big-endian `u32` length followed
//! by `(size, mode, modtime, BlockId, path)` as written by `codec::put_file`.

use std::path::Path;

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};

use super::index::FileIndex;
use crate::config::write_atomic;
use crate::wire::WireError;
use crate::wire::codec::{get_file, get_u32, put_file};

/// INDEX_FILE is the snapshot name inside the config directory.
pub const INDEX_FILE: &str = "fileIndex";

#[must_use]
pub fn encode_index(index: &FileIndex) -> Vec<u8> {
    let mut out = BytesMut::new();
    let mut entry = BytesMut::new();
    for file in index.files() {
        entry.clear();
        put_file(&mut entry, file);
        out.put_u32(u32::try_from(entry.len()).unwrap_or(u32::MAX));
        out.put_slice(&entry);
    }
    out.to_vec()
}

/// `decode_index` parses a snapshot produced by `encode_index`.
///
/// # Errors
/// Returns an error if an entry is truncated or malformed.
pub fn decode_index(bytes: &[u8]) -> Result<FileIndex, WireError> {
    let mut buf = bytes;
    let mut files = Vec::new();
    while !buf.is_empty() {
        let len = get_u32(&mut buf)? as usize;
        if buf.len() < len {
            return Err(WireError::Truncated);
        }
        let (mut entry, rest) = buf.split_at(len);
        files.push(get_file(&mut entry)?);
        if !entry.is_empty() {
            return Err(WireError::TrailingBytes(entry.len()));
        }
        buf = rest;
    }
    Ok(FileIndex::from_files(files))
}

/// `save_index` replaces the snapshot at `path`.
///
/// # Errors
/// Returns an error if the snapshot cannot be written.
pub async fn save_index(path: &Path, index: &FileIndex) -> Result<()> {
    write_atomic(path, &encode_index(index)).await
}

/// `load_index` reads the snapshot at `path`; a missing file is an empty index.
///
/// # Errors
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn load_index(path: &Path) -> Result<FileIndex> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(FileIndex::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    decode_index(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}
