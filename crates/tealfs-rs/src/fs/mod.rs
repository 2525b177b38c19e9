//! The replicated filesystem namespace.
//!
//! A single serializer task owns the `FileIndex` and every open handle.
//! `FileSystem` and `FileHandle` are cheap front-ends that submit requests
//! to it and wait for the reply.

mod file;
mod index;
mod path;
pub mod persist;
mod serializer;

#[cfg(test)]
mod fs_tests;

use std::io::SeekFrom;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{FsError, FsResult};

pub use file::{DEFAULT_DIR_MODE, File, MODE_DIR, Mutation, unix_now};
pub use index::FileIndex;
pub use path::FsPath;
pub use serializer::spawn_filesystem;

/// DEFAULT_FILE_MODE is used when a caller has no mode of its own.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

const READ_CHUNK: usize = 1 << 20;

/// OpenOptions mirrors the open flags a filesystem front-end passes through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenOptions {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            read: false,
            write: false,
            create: false,
            create_new: false,
            truncate: false,
            append: false,
        }
    }

    #[must_use]
    pub const fn read(mut self, value: bool) -> Self {
        self.read = value;
        self
    }

    #[must_use]
    pub const fn write(mut self, value: bool) -> Self {
        self.write = value;
        self
    }

    #[must_use]
    pub const fn create(mut self, value: bool) -> Self {
        self.create = value;
        self
    }

    #[must_use]
    pub const fn create_new(mut self, value: bool) -> Self {
        self.create_new = value;
        self
    }

    #[must_use]
    pub const fn truncate(mut self, value: bool) -> Self {
        self.truncate = value;
        self
    }

    #[must_use]
    pub const fn append(mut self, value: bool) -> Self {
        self.append = value;
        self
    }

    /// `validate` rejects contradictory flag combinations.
    ///
    /// # Errors
    /// Returns `InvalidFlags` naming the first offending combination.
    pub fn validate(&self) -> FsResult<()> {
        if !self.read && !self.write {
            return Err(FsError::InvalidFlags("neither read nor write"));
        }
        if !self.write && (self.truncate || self.append || self.create || self.create_new) {
            return Err(FsError::InvalidFlags("modifying flag without write"));
        }
        if self.truncate && self.append {
            return Err(FsError::InvalidFlags("truncate with append"));
        }
        Ok(())
    }
}

/// HandleId names one open handle inside the serializer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

#[derive(Debug)]
pub(crate) enum FsRequest {
    Mkdir {
        path: String,
        mode: u32,
        reply: oneshot::Sender<FsResult<File>>,
    },
    Open {
        path: String,
        opts: OpenOptions,
        mode: u32,
        reply: oneshot::Sender<FsResult<(HandleId, File)>>,
    },
    Rename {
        old: String,
        new: String,
        reply: oneshot::Sender<FsResult<()>>,
    },
    RemoveAll {
        path: String,
        reply: oneshot::Sender<FsResult<()>>,
    },
    Stat {
        path: String,
        reply: oneshot::Sender<FsResult<File>>,
    },
    Read {
        handle: HandleId,
        len: usize,
        reply: oneshot::Sender<FsResult<Vec<u8>>>,
    },
    Write {
        handle: HandleId,
        data: Vec<u8>,
        reply: oneshot::Sender<FsResult<usize>>,
    },
    Seek {
        handle: HandleId,
        pos: SeekFrom,
        reply: oneshot::Sender<FsResult<u64>>,
    },
    Readdir {
        handle: HandleId,
        count: i32,
        reply: oneshot::Sender<FsResult<Vec<File>>>,
    },
    Replace {
        path: String,
        data: Vec<u8>,
        mode: u32,
        reply: oneshot::Sender<FsResult<File>>,
    },
    HandleStat {
        handle: HandleId,
        reply: oneshot::Sender<FsResult<File>>,
    },
    Close {
        handle: HandleId,
        reply: Option<oneshot::Sender<FsResult<()>>>,
    },
}

/// FileSystem is a clonable front-end on the serializer task.
#[derive(Clone, Debug)]
pub struct FileSystem {
    tx: mpsc::Sender<FsRequest>,
}

impl FileSystem {
    pub(crate) const fn new(tx: mpsc::Sender<FsRequest>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<FsResult<T>>) -> FsRequest,
    ) -> FsResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| FsError::Stopped)?;
        rx.await.map_err(|_| FsError::Stopped)?
    }

    /// # Errors
    /// Fails when the path exists or its base is missing or not a directory.
    pub async fn mkdir(&self, path: &str, mode: u32) -> FsResult<File> {
        let path = path.to_string();
        self.call(|reply| FsRequest::Mkdir { path, mode, reply })
            .await
    }

    /// `open_file` opens or creates `path` according to `opts`. `mode` only
    /// applies to newly created files.
    ///
    /// # Errors
    /// Fails on invalid flags, missing files without create, existing files
    /// with `create_new`, and write access to directories.
    pub async fn open_file(&self, path: &str, opts: OpenOptions, mode: u32) -> FsResult<FileHandle> {
        let path = path.to_string();
        let (id, file) = self
            .call(|reply| FsRequest::Open {
                path,
                opts,
                mode,
                reply,
            })
            .await?;
        Ok(FileHandle {
            id,
            file,
            fs: self.clone(),
            closed: false,
        })
    }

    /// # Errors
    /// See `open_file`.
    pub async fn open(&self, path: &str) -> FsResult<FileHandle> {
        self.open_file(path, OpenOptions::new().read(true), 0).await
    }

    /// # Errors
    /// See `open_file`.
    pub async fn create(&self, path: &str) -> FsResult<FileHandle> {
        let opts = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true);
        self.open_file(path, opts, DEFAULT_FILE_MODE).await
    }

    /// # Errors
    /// Fails when `old` is missing, `new` exists, or `new` lies inside `old`.
    pub async fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let old = old.to_string();
        let new = new.to_string();
        self.call(|reply| FsRequest::Rename { old, new, reply })
            .await
    }

    /// `remove_all` deletes `path` and everything below it. Missing paths
    /// are not an error.
    ///
    /// # Errors
    /// Fails for malformed paths and for the root.
    pub async fn remove_all(&self, path: &str) -> FsResult<()> {
        let path = path.to_string();
        self.call(|reply| FsRequest::RemoveAll { path, reply })
            .await
    }

    /// # Errors
    /// Returns `NotFound` when nothing lives at `path`.
    pub async fn stat(&self, path: &str) -> FsResult<File> {
        let path = path.to_string();
        self.call(|reply| FsRequest::Stat { path, reply }).await
    }

    /// `read_file` returns the whole content of `path`.
    ///
    /// # Errors
    /// Fails when the file cannot be opened or its block cannot be fetched.
    pub async fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let mut handle = self.open(path).await?;
        let data = handle.read_to_end().await;
        handle.close().await?;
        data
    }

    /// `write_file` replaces the content of `path` with `data` in a single
    /// block put, creating the file when it is missing. Readers and peers see
    /// either the old content or the new one.
    ///
    /// # Errors
    /// Fails when the parent is missing, `path` is a directory, or the block
    /// put fails; the previous content is kept in every case.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = path.to_string();
        let data = data.to_vec();
        self.call(|reply| FsRequest::Replace {
            path,
            data,
            mode: DEFAULT_FILE_MODE,
            reply,
        })
        .await
        .map(|_| ())
    }

    /// `read_dir` lists the immediate children of a directory.
    ///
    /// # Errors
    /// Fails when `path` is missing or not a directory.
    pub async fn read_dir(&self, path: &str) -> FsResult<Vec<File>> {
        let mut handle = self.open(path).await?;
        let entries = handle.readdir(0).await;
        handle.close().await?;
        entries
    }
}

/// FileHandle is one open file or directory. Dropping it closes it.
#[derive(Debug)]
pub struct FileHandle {
    id: HandleId,
    file: File,
    fs: FileSystem,
    closed: bool,
}

impl FileHandle {
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// `file` is the entry as it was when the handle was opened.
    #[must_use]
    pub const fn file(&self) -> &File {
        &self.file
    }

    /// `read` returns up to `len` bytes at the current position; an empty
    /// vector means end of file.
    ///
    /// # Errors
    /// Fails for handles without read access and when the block fetch fails.
    pub async fn read(&mut self, len: usize) -> FsResult<Vec<u8>> {
        let handle = self.id;
        self.fs
            .call(|reply| FsRequest::Read { handle, len, reply })
            .await
    }

    /// # Errors
    /// See `read`.
    pub async fn read_to_end(&mut self) -> FsResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(READ_CHUNK).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// `write` stores `data` at the current position and advances it.
    ///
    /// # Errors
    /// Fails for handles without write access and when the block put fails;
    /// a failed write leaves the stored block and the position unchanged.
    pub async fn write(&mut self, data: &[u8]) -> FsResult<usize> {
        let handle = self.id;
        let data = data.to_vec();
        self.fs
            .call(|reply| FsRequest::Write {
                handle,
                data,
                reply,
            })
            .await
    }

    /// # Errors
    /// Returns `NegativeSeek` when the target lies before the start; the
    /// position is left unchanged.
    pub async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        let handle = self.id;
        self.fs
            .call(|reply| FsRequest::Seek { handle, pos, reply })
            .await
    }

    /// `readdir` returns up to `count` further children, or all remaining
    /// ones when `count` is 0.
    ///
    /// # Errors
    /// Fails for negative counts and non-directories.
    pub async fn readdir(&mut self, count: i32) -> FsResult<Vec<File>> {
        let handle = self.id;
        self.fs
            .call(|reply| FsRequest::Readdir {
                handle,
                count,
                reply,
            })
            .await
    }

    /// # Errors
    /// Returns `NotFound` once the entry has been removed.
    pub async fn stat(&self) -> FsResult<File> {
        let handle = self.id;
        self.fs
            .call(|reply| FsRequest::HandleStat { handle, reply })
            .await
    }

    /// # Errors
    /// Returns `BadHandle` when the handle was already closed.
    pub async fn close(mut self) -> FsResult<()> {
        self.closed = true;
        let handle = self.id;
        self.fs
            .call(|reply| FsRequest::Close {
                handle,
                reply: Some(reply),
            })
            .await
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let close = FsRequest::Close {
            handle: self.id,
            reply: None,
        };
        match self.fs.tx.try_send(close) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(close)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    warn!("fs: request queue full, {:?} leaks until shutdown", self.id);
                    return;
                };
                let tx = self.fs.tx.clone();
                runtime.spawn(async move {
                    let _ = tx.send(close).await;
                });
            }
        }
    }
}
