//! Read fallback: try one replica at a time in pointer order.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use tracing::debug;

use super::Manager;
use crate::disk::DiskRequest;
use crate::error::BlockError;
use crate::types::{Block, BlockId, DiskPointer, GetBlockId, NodeId};
use crate::wire::Payload;

pub type GetReply = oneshot::Sender<Result<Block, BlockError>>;

struct PendingGet {
    block_id: BlockId,
    current: DiskPointer,
    remaining: VecDeque<DiskPointer>,
    saw_empty: bool,
    reply: GetReply,
}

/// GetStep tells the manager what to do after a replica answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetStep {
    /// Ask this pointer next.
    Next(DiskPointer),
    /// The caller has been answered.
    Done,
    /// Unknown or stale result; nothing to do.
    Ignored,
}

/// GetTracker drives the sequential replica fallback of pending gets.
///
/// An empty block from a replica with more pointers left counts as a miss.
/// When every replica answered empty, or the last one did, the empty block
/// is the result.
#[derive(Default)]
pub struct GetTracker {
    pending: HashMap<GetBlockId, PendingGet>,
}

impl GetTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// `start` registers a get over `ptrs`, answering at once when there are
    /// no pointers.
    pub fn start(
        &mut self,
        get_id: GetBlockId,
        block_id: BlockId,
        ptrs: Vec<DiskPointer>,
        reply: GetReply,
    ) -> GetStep {
        let mut remaining: VecDeque<DiskPointer> = ptrs.into();
        let Some(current) = remaining.pop_front() else {
            let _ = reply.send(Err(BlockError::NoDisks));
            return GetStep::Done;
        };
        self.pending.insert(
            get_id,
            PendingGet {
                block_id,
                current: current.clone(),
                remaining,
                saw_empty: false,
                reply,
            },
        );
        GetStep::Next(current)
    }

    /// `on_result` folds the answer of `ptr` into its get.
    pub fn on_result(
        &mut self,
        get_id: &GetBlockId,
        ptr: &DiskPointer,
        result: Result<Block, BlockError>,
    ) -> GetStep {
        let Some(pending) = self.pending.get_mut(get_id) else {
            debug!("read: dropping late result for {get_id} from {ptr}");
            return GetStep::Ignored;
        };
        if &pending.current != ptr {
            debug!("read: dropping stale result for {get_id} from {ptr}");
            return GetStep::Ignored;
        }

        let last_error = match result {
            Ok(block) if !block.data.is_empty() || pending.remaining.is_empty() => {
                self.finish(get_id, Ok(block));
                return GetStep::Done;
            }
            Ok(_) => {
                pending.saw_empty = true;
                None
            }
            Err(err) => {
                debug!("read: {ptr} failed for {get_id}: {err}");
                Some(err)
            }
        };

        if let Some(next) = pending.remaining.pop_front() {
            pending.current = next.clone();
            return GetStep::Next(next);
        }

        let outcome = if pending.saw_empty {
            Ok(Block::empty(pending.block_id.clone()))
        } else {
            Err(last_error.unwrap_or(BlockError::NoDisks))
        };
        self.finish(get_id, outcome);
        GetStep::Done
    }

    /// `waiting_on` lists gets whose current replica lives on `node_id`.
    #[must_use]
    pub fn waiting_on(&self, node_id: &NodeId) -> Vec<(GetBlockId, DiskPointer)> {
        self.pending
            .iter()
            .filter(|(_, p)| &p.current.node_id == node_id)
            .map(|(id, p)| (id.clone(), p.current.clone()))
            .collect()
    }

    /// `fail_all` answers every pending get with `err`.
    pub fn fail_all(&mut self, err: &BlockError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }

    fn finish(&mut self, get_id: &GetBlockId, result: Result<Block, BlockError>) {
        if let Some(pending) = self.pending.remove(get_id) {
            let _ = pending.reply.send(result);
        }
    }
}

impl Manager {
    pub(super) async fn start_get(&mut self, block_id: BlockId, reply: GetReply) {
        let get_id = GetBlockId::generate();
        let ptrs = self.distributor.read_pointers_for(&block_id);
        debug!("read: {get_id} for {block_id} over {} replicas", ptrs.len());
        let step = self.gets.start(get_id.clone(), block_id, ptrs, reply);
        self.drive_get(&get_id, step).await;
    }

    pub(super) async fn on_read_result(
        &mut self,
        get_id: &GetBlockId,
        ptr: &DiskPointer,
        result: Result<Block, BlockError>,
    ) {
        let step = self.gets.on_result(get_id, ptr, result);
        self.drive_get(get_id, step).await;
    }

    /// `fail_gets_on` moves every get waiting on `node_id` to its next replica.
    pub(super) async fn fail_gets_on(&mut self, node_id: &NodeId) {
        for (get_id, ptr) in self.gets.waiting_on(node_id) {
            let step = self
                .gets
                .on_result(&get_id, &ptr, Err(BlockError::NoRoute(node_id.clone())));
            self.drive_get(&get_id, step).await;
        }
    }

    /// `drive_get` dispatches `step`, folding dispatch failures straight back
    /// into the fallback until a request is in flight or the get is answered.
    async fn drive_get(&mut self, get_id: &GetBlockId, mut step: GetStep) {
        while let GetStep::Next(ptr) = step {
            match self.send_read(get_id, &ptr).await {
                Ok(()) => return,
                Err(err) => step = self.gets.on_result(get_id, &ptr, Err(err)),
            }
        }
    }

    async fn send_read(&mut self, get_id: &GetBlockId, ptr: &DiskPointer) -> Result<(), BlockError> {
        if ptr.node_id == self.node_id {
            let disk = self
                .disks
                .get(&ptr.disk_id)
                .cloned()
                .ok_or_else(|| BlockError::Io(format!("unknown local disk {}", ptr.disk_id)))?;
            let req = DiskRequest::Read {
                caller: self.node_id.clone(),
                get_id: get_id.clone(),
                ptr: ptr.clone(),
            };
            return disk
                .submit(req)
                .await
                .map_err(|_| BlockError::Io(format!("disk {} stopped", ptr.disk_id)));
        }

        let conn = self
            .mapper
            .conn_for_node(&ptr.node_id)
            .ok_or_else(|| BlockError::NoRoute(ptr.node_id.clone()))?;
        let payload = Payload::ReadRequest {
            caller: self.node_id.clone(),
            get_id: get_id.clone(),
            ptr: ptr.clone(),
        };
        self.conns
            .send(conn, payload)
            .map_err(|_| BlockError::NoRoute(ptr.node_id.clone()))
    }

    /// `on_remote_read` serves a replica read for a peer.
    pub(super) async fn on_remote_read(
        &mut self,
        caller: NodeId,
        get_id: GetBlockId,
        ptr: DiskPointer,
    ) {
        let disk = if ptr.node_id == self.node_id {
            self.disks.get(&ptr.disk_id).cloned()
        } else {
            None
        };
        let failure = match disk {
            Some(disk) => {
                let req = DiskRequest::Read {
                    caller: caller.clone(),
                    get_id: get_id.clone(),
                    ptr: ptr.clone(),
                };
                match disk.submit(req).await {
                    Ok(()) => return,
                    Err(_) => format!("disk {} stopped", ptr.disk_id),
                }
            }
            None => format!("{ptr} is not a disk of {}", self.node_id),
        };
        let to = caller.clone();
        self.send_to_node(
            &to,
            Payload::ReadResult {
                caller,
                get_id,
                ptr,
                result: Err(failure),
            },
        );
    }
}
