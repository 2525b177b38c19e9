use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::file::{File, Mutation, unix_now};
use super::index::FileIndex;
use super::path::FsPath;
use super::persist::save_index;
use super::{FileSystem, FsRequest, HandleId, OpenOptions};
use crate::error::{FsError, FsResult};
use crate::manager::BlockClient;
use crate::types::{Block, BlockId};
use crate::wire::MAX_BLOCK_LEN;

struct OpenHandle {
    path: FsPath,
    opts: OpenOptions,
    position: u64,
    dir_offset: usize,
    /// Block content, loaded on first read or write.
    data: Option<Vec<u8>>,
    /// Opened with `truncate`; the empty content is stored by the first
    /// write or by close.
    truncate_pending: bool,
}

struct Serializer {
    index: FileIndex,
    index_path: PathBuf,
    blocks: BlockClient,
    handles: HashMap<HandleId, OpenHandle>,
    next_handle: u64,
}

/// `spawn_filesystem` starts the task that owns `index` and returns the
/// front-end for it. Remote mutations are applied in arrival order and the
/// index is saved to `index_path` after every change.
pub fn spawn_filesystem(
    index: FileIndex,
    index_path: PathBuf,
    blocks: BlockClient,
    remote: mpsc::UnboundedReceiver<Mutation>,
    capacity: usize,
    shutdown: watch::Receiver<bool>,
) -> (FileSystem, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let serializer = Serializer {
        index,
        index_path,
        blocks,
        handles: HashMap::new(),
        next_handle: 1,
    };
    let task = tokio::spawn(serializer.run(rx, remote, shutdown));
    (FileSystem::new(tx), task)
}

impl Serializer {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<FsRequest>,
        mut remote: mpsc::UnboundedReceiver<Mutation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("fs: serving {} entries", self.index.len());
        let mut remote_open = true;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
                req = requests.recv() => match req {
                    Some(req) => self.handle(req).await,
                    None => break,
                },
                mutation = remote.recv(), if remote_open => match mutation {
                    Some(mutation) => self.apply_remote(mutation).await,
                    None => remote_open = false,
                },
            }
        }
        if let Err(err) = save_index(&self.index_path, &self.index).await {
            warn!("fs: final index save failed: {err:#}");
        }
        info!("fs: shutdown");
    }

    async fn handle(&mut self, req: FsRequest) {
        match req {
            FsRequest::Mkdir { path, mode, reply } => {
                let _ = reply.send(self.mkdir(&path, mode).await);
            }
            FsRequest::Open {
                path,
                opts,
                mode,
                reply,
            } => {
                let _ = reply.send(self.open(&path, opts, mode).await);
            }
            FsRequest::Rename { old, new, reply } => {
                let _ = reply.send(self.rename(&old, &new).await);
            }
            FsRequest::RemoveAll { path, reply } => {
                let _ = reply.send(self.remove_all(&path).await);
            }
            FsRequest::Stat { path, reply } => {
                let _ = reply.send(FsPath::parse(&path).and_then(|p| self.index.stat(&p)));
            }
            FsRequest::Read { handle, len, reply } => {
                let _ = reply.send(self.read(handle, len).await);
            }
            FsRequest::Write {
                handle,
                data,
                reply,
            } => {
                let _ = reply.send(self.write(handle, &data).await);
            }
            FsRequest::Seek { handle, pos, reply } => {
                let _ = reply.send(self.seek(handle, pos));
            }
            FsRequest::Readdir {
                handle,
                count,
                reply,
            } => {
                let _ = reply.send(self.readdir(handle, count));
            }
            FsRequest::Replace {
                path,
                data,
                mode,
                reply,
            } => {
                let _ = reply.send(self.replace(&path, data, mode).await);
            }
            FsRequest::HandleStat { handle, reply } => {
                let result = self.handles.get(&handle).ok_or(FsError::BadHandle).and_then(|h| {
                    let file = self.index.stat(&h.path)?;
                    Ok(if h.truncate_pending {
                        File { size: 0, ..file }
                    } else {
                        file
                    })
                });
                let _ = reply.send(result);
            }
            FsRequest::Close { handle, reply } => {
                let result = self.close(handle).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            warn!("fs: closing dropped {handle:?}: {err}");
                        }
                    }
                }
            }
        }
    }

    async fn mkdir(&mut self, raw: &str, mode: u32) -> FsResult<File> {
        let path = FsPath::parse(raw)?;
        let dir = self.index.mkdir(&path, mode)?;
        debug!("fs: mkdir {path}");
        self.blocks.broadcast(Mutation::Upsert(dir.clone())).await;
        self.persist().await?;
        Ok(dir)
    }

    async fn open(&mut self, raw: &str, opts: OpenOptions, mode: u32) -> FsResult<(HandleId, File)> {
        opts.validate()?;
        let path = FsPath::parse(raw)?;

        let (file, data, truncate_pending) = match self.index.stat(&path) {
            Ok(existing) => {
                if opts.create_new {
                    return Err(FsError::AlreadyExists(path.to_string()));
                }
                if existing.is_dir() && opts.write {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
                if opts.truncate && existing.size > 0 {
                    (File { size: 0, ..existing }, Some(Vec::new()), true)
                } else {
                    (existing, None, false)
                }
            }
            Err(FsError::NotFound(_)) if opts.create || opts.create_new => {
                let created = self.index.create(&path, mode)?;
                debug!("fs: created {path}");
                self.blocks.broadcast(Mutation::Upsert(created.clone())).await;
                self.persist().await?;
                (created, Some(Vec::new()), false)
            }
            Err(err) => return Err(err),
        };

        let id = HandleId(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(
            id,
            OpenHandle {
                path,
                opts,
                position: 0,
                dir_offset: 0,
                data,
                truncate_pending,
            },
        );
        Ok((id, file))
    }

    /// `close` forgets the handle, storing a truncation no write committed.
    async fn close(&mut self, id: HandleId) -> FsResult<()> {
        let handle = self.handles.remove(&id).ok_or(FsError::BadHandle)?;
        if !handle.truncate_pending {
            return Ok(());
        }
        match self.index.stat(&handle.path) {
            Ok(entry) if !entry.is_dir() => self.store(&entry, Vec::new()).await.map(|_| ()),
            Ok(_) | Err(FsError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// `replace` stores `data` as the whole content of `path` with a single
    /// put, creating the file when it is missing. A failed put leaves the
    /// previous state untouched.
    async fn replace(&mut self, raw: &str, data: Vec<u8>, mode: u32) -> FsResult<File> {
        let path = FsPath::parse(raw)?;
        if data.len() > MAX_BLOCK_LEN {
            return Err(FsError::FileTooLarge);
        }
        match self.index.stat(&path) {
            Ok(existing) if existing.is_dir() => Err(FsError::IsADirectory(path.to_string())),
            Ok(existing) => {
                let stored = self.store(&existing, data).await?;
                self.invalidate(&path);
                Ok(stored)
            }
            Err(FsError::NotFound(_)) => {
                let created = self.index.create(&path, mode)?;
                match self.store(&created, data).await {
                    Err(err @ FsError::BlockPut(_)) => {
                        let _ = self.index.remove_all(&path);
                        Err(err)
                    }
                    result => {
                        debug!("fs: created {path}");
                        result
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn rename(&mut self, old: &str, new: &str) -> FsResult<()> {
        let old = FsPath::parse(old)?;
        let new = FsPath::parse(new)?;
        let pairs = self.index.rename(&old, &new)?;
        info!("fs: renamed {old} -> {new} ({} entries)", pairs.len());

        for (before, after) in &pairs {
            for handle in self.handles.values_mut() {
                if handle.path == before.path {
                    handle.path = after.path.clone();
                }
            }
            self.blocks.broadcast(Mutation::Upsert(after.clone())).await;
            self.blocks.broadcast(Mutation::Delete(before.clone())).await;
        }
        if pairs.is_empty() {
            return Ok(());
        }
        self.persist().await
    }

    async fn remove_all(&mut self, raw: &str) -> FsResult<()> {
        let path = FsPath::parse(raw)?;
        if path.is_root() {
            return Err(FsError::InvalidPath("cannot remove the root".to_string()));
        }
        let removed = self.index.remove_all(&path);
        if removed.is_empty() {
            return Ok(());
        }
        info!("fs: removed {path} ({} entries)", removed.len());

        let mut released = BTreeSet::new();
        for file in removed {
            released.insert(file.block_id.clone());
            self.blocks.broadcast(Mutation::Delete(file)).await;
        }
        self.collect_unreferenced(released).await;
        self.persist().await
    }

    async fn read(&mut self, id: HandleId, len: usize) -> FsResult<Vec<u8>> {
        let (path, readable) = {
            let handle = self.handles.get(&id).ok_or(FsError::BadHandle)?;
            (handle.path.clone(), handle.opts.read)
        };
        if !readable {
            return Err(FsError::NotReadable);
        }
        let entry = self.index.stat(&path)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.load(id, &entry).await?;

        let handle = self.handles.get_mut(&id).ok_or(FsError::BadHandle)?;
        let data = handle.data.as_deref().unwrap_or_default();
        let start = usize::try_from(handle.position).unwrap_or(usize::MAX);
        if start >= data.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(len).min(data.len());
        let chunk = data[start..end].to_vec();
        handle.position += chunk.len() as u64;
        Ok(chunk)
    }

    async fn write(&mut self, id: HandleId, bytes: &[u8]) -> FsResult<usize> {
        let (path, opts) = {
            let handle = self.handles.get(&id).ok_or(FsError::BadHandle)?;
            (handle.path.clone(), handle.opts)
        };
        if !opts.write {
            return Err(FsError::NotWritable);
        }
        let entry = self.index.stat(&path)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        self.load(id, &entry).await?;

        let (position, end, mut content) = {
            let handle = self.handles.get(&id).ok_or(FsError::BadHandle)?;
            let current = handle.data.as_deref().unwrap_or_default();
            let position = if opts.append {
                current.len() as u64
            } else {
                handle.position
            };
            let end = write_end(position, bytes.len()).ok_or(FsError::FileTooLarge)?;
            (end - bytes.len(), end, current.to_vec())
        };
        splice(&mut content, position, bytes);

        // Commit the handle only once the block is stored.
        self.store(&entry, content.clone()).await?;
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.data = Some(content);
            handle.position = end as u64;
            handle.truncate_pending = false;
        }
        Ok(bytes.len())
    }

    fn seek(&mut self, id: HandleId, pos: SeekFrom) -> FsResult<u64> {
        let handle = self.handles.get(&id).ok_or(FsError::BadHandle)?;
        let size = match &handle.data {
            Some(data) => data.len() as u64,
            None => self.index.stat(&handle.path).map(|f| f.size).unwrap_or(0),
        };
        let target = match pos {
            SeekFrom::Start(offset) => Some(i128::from(offset)),
            SeekFrom::Current(delta) => Some(i128::from(handle.position) + i128::from(delta)),
            SeekFrom::End(delta) => Some(i128::from(size) + i128::from(delta)),
        };
        let target = target
            .filter(|t| *t >= 0)
            .and_then(|t| u64::try_from(t).ok())
            .ok_or(FsError::NegativeSeek)?;
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.position = target;
        }
        Ok(target)
    }

    fn readdir(&mut self, id: HandleId, count: i32) -> FsResult<Vec<File>> {
        if count < 0 {
            return Err(FsError::NegativeCount);
        }
        let handle = self.handles.get_mut(&id).ok_or(FsError::BadHandle)?;
        let children = self.index.children(&handle.path)?;
        let remaining = children.into_iter().skip(handle.dir_offset);
        let batch: Vec<File> = if count == 0 {
            remaining.collect()
        } else {
            remaining.take(count as usize).collect()
        };
        handle.dir_offset += batch.len();
        Ok(batch)
    }

    async fn apply_remote(&mut self, mutation: Mutation) {
        debug!("fs: remote {} {}", kind(&mutation), mutation.file().path);
        let incoming = mutation.file().clone();
        let displaced = self.index.apply(&mutation);

        self.invalidate(&incoming.path);

        let mut released = BTreeSet::new();
        match (&mutation, displaced) {
            (Mutation::Upsert(_), Some(old)) if old.block_id != incoming.block_id => {
                released.insert(old.block_id);
            }
            (Mutation::Delete(_), Some(old)) => {
                released.insert(old.block_id);
            }
            _ => {}
        }
        self.collect_unreferenced(released).await;

        if let Err(err) = self.persist().await {
            warn!("fs: {err}");
        }
    }

    /// `invalidate` drops cached content of handles on `path` so the next
    /// access refetches it. Handles still owing a truncation keep theirs.
    fn invalidate(&mut self, path: &FsPath) {
        for handle in self.handles.values_mut() {
            if handle.path == *path && !handle.truncate_pending {
                handle.data = None;
            }
        }
    }

    async fn load(&mut self, id: HandleId, entry: &File) -> FsResult<()> {
        let loaded = self
            .handles
            .get(&id)
            .is_some_and(|h| h.data.is_some());
        if loaded {
            return Ok(());
        }
        let block = self
            .blocks
            .get(entry.block_id.clone())
            .await
            .map_err(FsError::BlockGet)?;
        if let Some(handle) = self.handles.get_mut(&id) {
            handle.data = Some(block.data);
        }
        Ok(())
    }

    /// `store` puts `content` as the entry's block and records the new size.
    async fn store(&mut self, entry: &File, content: Vec<u8>) -> FsResult<File> {
        let size = content.len() as u64;
        self.blocks
            .put(Block::new(entry.block_id.clone(), content))
            .await
            .map_err(FsError::BlockPut)?;

        let updated = File {
            size,
            modtime: unix_now(),
            ..entry.clone()
        };
        self.index.upsert(updated.clone());
        self.blocks.broadcast(Mutation::Upsert(updated.clone())).await;
        self.persist().await?;
        Ok(updated)
    }

    async fn collect_unreferenced(&self, released: BTreeSet<BlockId>) {
        for block_id in released {
            if !self.index.references(&block_id) {
                self.blocks.collect(block_id).await;
            }
        }
    }

    async fn persist(&self) -> FsResult<()> {
        save_index(&self.index_path, &self.index)
            .await
            .map_err(|err| FsError::Persist(format!("{err:#}")))
    }
}

/// `write_end` is the file length after writing `len` bytes at `position`,
/// or `None` when that would not fit in a block.
fn write_end(position: u64, len: usize) -> Option<usize> {
    let end = position.checked_add(u64::try_from(len).ok()?)?;
    usize::try_from(end).ok().filter(|end| *end <= MAX_BLOCK_LEN)
}

/// `splice` writes `bytes` at `position`, zero-filling any gap. Callers bound
/// `position + bytes.len()` with `write_end` first.
fn splice(content: &mut Vec<u8>, position: usize, bytes: &[u8]) {
    let end = position + bytes.len();
    if content.len() < position {
        content.resize(position, 0);
    }
    if content.len() < end {
        content.resize(end, 0);
    }
    content[position..end].copy_from_slice(bytes);
}

const fn kind(mutation: &Mutation) -> &'static str {
    match mutation {
        Mutation::Upsert(_) => "upsert",
        Mutation::Delete(_) => "delete",
    }
}
