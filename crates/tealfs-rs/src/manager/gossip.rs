//! Membership: I-AM handshakes, SyncNodes gossip and re-replication toward
//! nodes that (re)join.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Manager;
use crate::disk::DiskHandle;
use crate::placement::MirrorDistributor;
use crate::types::{ConnId, DiskInfo, NodeId, PutBlockId};
use crate::wire::Payload;

impl Manager {
    pub(super) fn iam(&self) -> Payload {
        Payload::IAm {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            disks: self.distributor.disks_of(&self.node_id),
        }
    }

    pub(super) fn send_iam(&self, conn: ConnId) {
        if self.conns.send(conn, self.iam()).is_err() {
            debug!("gossip: {conn} closed before I-AM");
        }
    }

    /// `announce` re-sends I-AM on every open connection after the local
    /// disk set changed.
    pub(super) fn announce(&self) {
        let iam = self.iam();
        for conn in self.conns.ids() {
            let _ = self.conns.send(conn, iam.clone());
        }
    }

    pub(super) fn on_iam(
        &mut self,
        conn: ConnId,
        node_id: NodeId,
        address: String,
        disks: &[DiskInfo],
    ) {
        if node_id == self.node_id {
            debug!("gossip: {conn} loops back to this node, closing");
            self.mapper.discard_conn(conn);
            self.conns.close(conn);
            self.publish_membership();
            return;
        }

        if let Some(previous) = self.mapper.bind(conn, &node_id, &address) {
            debug!("gossip: {node_id} moved from {previous} to {conn}");
        }
        self.distributor.set_node_disks(&node_id, disks);
        info!(
            "gossip: {node_id} at {address} on {conn} with {} disks",
            disks.len()
        );
        self.publish_membership();
        self.broadcast_sync_nodes();
        self.spawn_repair(node_id, conn);
    }

    /// `on_sync_nodes` dials every advertised node this node has never met.
    pub(super) fn on_sync_nodes(&mut self, nodes: Vec<(NodeId, String)>) {
        for (node_id, address) in nodes {
            if node_id == self.node_id || address == self.address {
                continue;
            }
            if self.mapper.is_known(&node_id) {
                continue;
            }
            debug!("gossip: learned {node_id} at {address}");
            self.connect_to(address);
        }
    }

    fn broadcast_sync_nodes(&self) {
        let mut nodes = self.mapper.known_nodes();
        nodes.push((self.node_id.clone(), self.address.clone()));
        self.broadcast(&Payload::SyncNodes { nodes });
    }

    fn spawn_repair(&self, target: NodeId, conn: ConnId) {
        if self.disks.is_empty() {
            return;
        }
        let Some(outbound) = self.conns.sender(conn) else {
            return;
        };
        let distributor = self.distributor.clone();
        let disks: Vec<DiskHandle> = self.disks.values().cloned().collect();
        let caller = self.node_id.clone();
        tokio::spawn(repair(caller, target, distributor, disks, outbound));
    }
}

/// `repair` pushes every local block whose write pointers name a disk of
/// `target` to that node. Results come back as untracked write results.
async fn repair(
    caller: NodeId,
    target: NodeId,
    distributor: MirrorDistributor,
    disks: Vec<DiskHandle>,
    outbound: mpsc::UnboundedSender<Payload>,
) {
    let mut sent = 0usize;
    for disk in disks {
        let ids = match disk.list_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!("repair: listing {}: {err}", disk.path().display());
                continue;
            }
        };
        for block_id in ids {
            let dests: Vec<_> = distributor
                .write_pointers_for(&block_id)
                .into_iter()
                .filter(|ptr| ptr.node_id == target)
                .collect();
            if dests.is_empty() {
                continue;
            }
            let block = match disk.fetch(block_id).await {
                Ok(block) => block,
                Err(err) => {
                    warn!("repair: reading {}: {err}", disk.path().display());
                    continue;
                }
            };
            for dest in dests {
                let payload = Payload::WriteRequest {
                    caller: caller.clone(),
                    put_id: PutBlockId::generate(),
                    dest,
                    block: block.clone(),
                };
                if outbound.send(payload).is_err() {
                    debug!("repair: connection to {target} closed");
                    return;
                }
                sent += 1;
            }
        }
    }
    if sent > 0 {
        info!("repair: sent {sent} replicas to {target}");
    }
}
