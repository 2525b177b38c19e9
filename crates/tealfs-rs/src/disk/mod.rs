//! Per-disk executor.
//!
//! One task owns one directory and applies every request against it in
//! submission order. Block data lives at `<dir>/<blockId>`.

#[cfg(test)]
mod disk_tests;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{Block, BlockId, DiskId, DiskPointer, GetBlockId, NodeId, PutBlockId};

const TMP_SUFFIX: &str = ".tmp";

/// DiskRequest is one operation queued on an executor.
#[derive(Debug)]
pub enum DiskRequest {
    /// Answered with `DiskEvent::Written` on the event channel.
    Write {
        caller: NodeId,
        put_id: PutBlockId,
        dest: DiskPointer,
        block: Block,
    },
    /// Answered with `DiskEvent::Read` on the event channel.
    Read {
        caller: NodeId,
        get_id: GetBlockId,
        ptr: DiskPointer,
    },
    /// Direct read used by repair; not-found is an empty block.
    Fetch {
        block_id: BlockId,
        reply: oneshot::Sender<Result<Block, String>>,
    },
    Exists {
        block_id: BlockId,
        reply: oneshot::Sender<bool>,
    },
    ListIds {
        reply: oneshot::Sender<Result<HashSet<BlockId>, String>>,
    },
    Delete {
        block_id: BlockId,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// DiskEvent is a completion the executor reports back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskEvent {
    Written {
        caller: NodeId,
        put_id: PutBlockId,
        dest: DiskPointer,
        result: Result<(), String>,
    },
    Read {
        caller: NodeId,
        get_id: GetBlockId,
        ptr: DiskPointer,
        result: Result<Block, String>,
    },
}

/// DiskHandle addresses one running executor.
#[derive(Clone, Debug)]
pub struct DiskHandle {
    disk_id: DiskId,
    path: PathBuf,
    tx: mpsc::Sender<DiskRequest>,
}

impl DiskHandle {
    #[must_use]
    pub const fn disk_id(&self) -> &DiskId {
        &self.disk_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `submit` queues a request, handing it back if the executor is gone.
    ///
    /// # Errors
    /// Returns the request when the executor has stopped.
    pub async fn submit(&self, req: DiskRequest) -> Result<(), DiskRequest> {
        self.tx.send(req).await.map_err(|err| err.0)
    }

    pub async fn exists(&self, block_id: BlockId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.submit(DiskRequest::Exists { block_id, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// # Errors
    /// Returns an error if the directory cannot be listed or the executor stopped.
    pub async fn list_ids(&self) -> Result<HashSet<BlockId>, String> {
        let (reply, rx) = oneshot::channel();
        self.submit(DiskRequest::ListIds { reply })
            .await
            .map_err(|_| stopped(&self.disk_id))?;
        rx.await.map_err(|_| stopped(&self.disk_id))?
    }

    /// # Errors
    /// Returns an error if the file cannot be read or the executor stopped.
    pub async fn fetch(&self, block_id: BlockId) -> Result<Block, String> {
        let (reply, rx) = oneshot::channel();
        self.submit(DiskRequest::Fetch { block_id, reply })
            .await
            .map_err(|_| stopped(&self.disk_id))?;
        rx.await.map_err(|_| stopped(&self.disk_id))?
    }

    /// # Errors
    /// Returns an error if the file exists but cannot be removed.
    pub async fn delete(&self, block_id: BlockId) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.submit(DiskRequest::Delete { block_id, reply })
            .await
            .map_err(|_| stopped(&self.disk_id))?;
        rx.await.map_err(|_| stopped(&self.disk_id))?
    }
}

fn stopped(disk_id: &DiskId) -> String {
    format!("disk {disk_id} executor stopped")
}

/// `spawn_executor` starts the task owning `dir`.
///
/// Requests are bounded by `capacity`; completions go out on the unbounded
/// `events` channel so the executor never waits on the manager.
pub fn spawn_executor(
    disk_id: DiskId,
    dir: PathBuf,
    capacity: usize,
    events: mpsc::UnboundedSender<DiskEvent>,
    shutdown: watch::Receiver<bool>,
) -> (DiskHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = DiskHandle {
        disk_id: disk_id.clone(),
        path: dir.clone(),
        tx,
    };
    let task = tokio::spawn(run_executor(disk_id, dir, rx, events, shutdown));
    (handle, task)
}

async fn run_executor(
    disk_id: DiskId,
    dir: PathBuf,
    mut rx: mpsc::Receiver<DiskRequest>,
    events: mpsc::UnboundedSender<DiskEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("disk: {disk_id} serving {}", dir.display());
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("disk: {disk_id} shutdown");
                    break;
                }
            },
            maybe_req = rx.recv() => {
                let Some(req) = maybe_req else {
                    debug!("disk: {disk_id} request channel closed");
                    break;
                };
                handle_request(&dir, req, &events).await;
            },
        }
    }
}

async fn handle_request(dir: &Path, req: DiskRequest, events: &mpsc::UnboundedSender<DiskEvent>) {
    match req {
        DiskRequest::Write {
            caller,
            put_id,
            dest,
            block,
        } => {
            let result = write_block(dir, &dest.file_name, &block.data)
                .await
                .map_err(|err| format!("write {}: {err}", dest));
            if let Err(err) = &result {
                warn!("disk: {err}");
            }
            let _ = events.send(DiskEvent::Written {
                caller,
                put_id,
                dest,
                result,
            });
        }
        DiskRequest::Read { caller, get_id, ptr } => {
            let result = read_block(dir, &ptr.file_name)
                .await
                .map_err(|err| format!("read {}: {err}", ptr));
            let _ = events.send(DiskEvent::Read {
                caller,
                get_id,
                ptr,
                result,
            });
        }
        DiskRequest::Fetch { block_id, reply } => {
            let result = read_block(dir, block_id.as_str())
                .await
                .map_err(|err| format!("read {block_id}: {err}"));
            let _ = reply.send(result);
        }
        DiskRequest::Exists { block_id, reply } => {
            let exists = match block_path(dir, block_id.as_str()) {
                Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
                Err(_) => false,
            };
            let _ = reply.send(exists);
        }
        DiskRequest::ListIds { reply } => {
            let result = list_ids(dir)
                .await
                .map_err(|err| format!("list {}: {err}", dir.display()));
            let _ = reply.send(result);
        }
        DiskRequest::Delete { block_id, reply } => {
            let result = delete_block(dir, block_id.as_str())
                .await
                .map_err(|err| format!("delete {block_id}: {err}"));
            let _ = reply.send(result);
        }
    }
}

/// `block_path` resolves a block file name, refusing anything that would
/// escape the disk directory.
fn block_path(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    if file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\', '\0'])
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid block file name {file_name:?}"),
        ));
    }
    Ok(dir.join(file_name))
}

/// `write_block` replaces the block file through a temp sibling so a reader
/// never observes a partial write.
async fn write_block(dir: &Path, file_name: &str, data: &[u8]) -> io::Result<()> {
    let path = block_path(dir, file_name)?;
    let tmp = dir.join(format!("{file_name}{TMP_SUFFIX}"));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, &path).await
}

async fn read_block(dir: &Path, file_name: &str) -> io::Result<Block> {
    let path = block_path(dir, file_name)?;
    let id = BlockId::from(file_name);
    match tokio::fs::read(&path).await {
        Ok(data) => Ok(Block::new(id, data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Block::empty(id)),
        Err(err) => Err(err),
    }
}

async fn delete_block(dir: &Path, file_name: &str) -> io::Result<()> {
    let path = block_path(dir, file_name)?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

async fn list_ids(dir: &Path) -> io::Result<HashSet<BlockId>> {
    let mut ids = HashSet::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.ends_with(TMP_SUFFIX) {
            continue;
        }
        ids.insert(BlockId(name));
    }
    Ok(ids)
}
