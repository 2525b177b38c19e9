//! Write fan-out: one put goes to every write pointer and succeeds only when
//! every replica acknowledged.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::Manager;
use crate::disk::DiskRequest;
use crate::error::BlockError;
use crate::types::{Block, DiskId, DiskPointer, NodeId, PutBlockId};
use crate::wire::Payload;

pub type PutReply = oneshot::Sender<Result<(), BlockError>>;

struct PendingPut {
    outstanding: HashMap<DiskId, NodeId>,
    reply: PutReply,
}

/// PutOutcome reports what a replica result did to its put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Other replicas are still outstanding.
    Waiting,
    /// The caller has been answered.
    Completed(Result<(), BlockError>),
    /// No put with this id is pending; the result is dropped.
    Unknown,
}

/// PutTracker correlates replica results with pending puts.
///
/// The first failing replica answers the caller and removes the entry, so
/// later results for that put land on `Unknown`.
#[derive(Default)]
pub struct PutTracker {
    pending: HashMap<PutBlockId, PendingPut>,
}

impl PutTracker {
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

    /// `start` registers a put waiting on every pointer in `dests`.
    pub fn start(&mut self, put_id: PutBlockId, dests: &[DiskPointer], reply: PutReply) {
        let outstanding = dests
            .iter()
            .map(|d| (d.disk_id.clone(), d.node_id.clone()))
            .collect();
        self.pending
            .insert(put_id, PendingPut { outstanding, reply });
    }

    /// `on_result` folds one replica result into its put.
    pub fn on_result(
        &mut self,
        put_id: &PutBlockId,
        dest: &DiskPointer,
        result: Result<(), BlockError>,
    ) -> PutOutcome {
        let Some(pending) = self.pending.get_mut(put_id) else {
            debug!("write: dropping late result for {put_id} from {dest}");
            return PutOutcome::Unknown;
        };
        match result {
            Err(err) => {
                if let Some(pending) = self.pending.remove(put_id) {
                    let _ = pending.reply.send(Err(err.clone()));
                }
                PutOutcome::Completed(Err(err))
            }
            Ok(()) => {
                pending.outstanding.remove(&dest.disk_id);
                if !pending.outstanding.is_empty() {
                    return PutOutcome::Waiting;
                }
                if let Some(pending) = self.pending.remove(put_id) {
                    let _ = pending.reply.send(Ok(()));
                }
                PutOutcome::Completed(Ok(()))
            }
        }
    }

    /// `fail_node` fails every put still waiting on a replica of `node_id`.
    pub fn fail_node(&mut self, node_id: &NodeId) -> Vec<PutBlockId> {
        let doomed: Vec<PutBlockId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.outstanding.values().any(|n| n == node_id))
            .map(|(id, _)| id.clone())
            .collect();
        for put_id in &doomed {
            if let Some(pending) = self.pending.remove(put_id) {
                let _ = pending
                    .reply
                    .send(Err(BlockError::NoRoute(node_id.clone())));
            }
        }
        doomed
    }

    /// `fail_all` answers every pending put with `err`.
    pub fn fail_all(&mut self, err: &BlockError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }
}

impl Manager {
    pub(super) async fn start_put(&mut self, block: Block, reply: PutReply) {
        let dests = self.distributor.write_pointers_for(&block.id);
        if dests.is_empty() {
            let _ = reply.send(Err(BlockError::NoDisks));
            return;
        }
        let put_id = PutBlockId::generate();
        debug!("write: {put_id} for {} to {} replicas", block.id, dests.len());
        self.puts.start(put_id.clone(), &dests, reply);

        for dest in dests {
            if let Err(err) = self.send_write(&put_id, dest.clone(), block.clone()).await {
                self.on_write_result(&put_id, &dest, Err(err));
            }
        }
    }

    pub(super) fn on_write_result(
        &mut self,
        put_id: &PutBlockId,
        dest: &DiskPointer,
        result: Result<(), BlockError>,
    ) {
        if let PutOutcome::Completed(Err(err)) = self.puts.on_result(put_id, dest, result) {
            warn!("write: {put_id} failed at {dest}: {err}");
        }
    }

    async fn send_write(
        &mut self,
        put_id: &PutBlockId,
        dest: DiskPointer,
        block: Block,
    ) -> Result<(), BlockError> {
        if dest.node_id == self.node_id {
            let disk = self
                .disks
                .get(&dest.disk_id)
                .cloned()
                .ok_or_else(|| BlockError::Io(format!("unknown local disk {}", dest.disk_id)))?;
            let req = DiskRequest::Write {
                caller: self.node_id.clone(),
                put_id: put_id.clone(),
                dest,
                block,
            };
            return disk
                .submit(req)
                .await
                .map_err(|_| BlockError::Io(format!("disk {} stopped", disk.disk_id())));
        }

        let conn = self
            .mapper
            .conn_for_node(&dest.node_id)
            .ok_or_else(|| BlockError::NoRoute(dest.node_id.clone()))?;
        let node_id = dest.node_id.clone();
        let payload = Payload::WriteRequest {
            caller: self.node_id.clone(),
            put_id: put_id.clone(),
            dest,
            block,
        };
        self.conns
            .send(conn, payload)
            .map_err(|_| BlockError::NoRoute(node_id))
    }

    /// `on_remote_write` stores a replica a peer asked for and answers it
    /// once the executor reports back.
    pub(super) async fn on_remote_write(
        &mut self,
        caller: NodeId,
        put_id: PutBlockId,
        dest: DiskPointer,
        block: Block,
    ) {
        let disk = if dest.node_id == self.node_id {
            self.disks.get(&dest.disk_id).cloned()
        } else {
            None
        };
        let Some(disk) = disk else {
            let result = Err(format!("{dest} is not a disk of {}", self.node_id));
            let to = caller.clone();
            self.send_to_node(
                &to,
                Payload::WriteResult {
                    caller,
                    put_id,
                    dest,
                    result,
                },
            );
            return;
        };

        let req = DiskRequest::Write {
            caller,
            put_id,
            dest,
            block,
        };
        if let Err(DiskRequest::Write {
            caller,
            put_id,
            dest,
            ..
        }) = disk.submit(req).await
        {
            let to = caller.clone();
            let result = Err(format!("disk {} stopped", dest.disk_id));
            self.send_to_node(
                &to,
                Payload::WriteResult {
                    caller,
                    put_id,
                    dest,
                    result,
                },
            );
        }
    }
}
