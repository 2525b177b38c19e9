//! The node's central event loop.
//!
//! One task owns the mapper, the distributor, the local disk handles, the
//! connection table and the put/get correlation tables. Everything else
//! talks to it through channels, and it never waits on the filesystem task.

mod client;
mod gossip;
mod read;
mod write;

#[cfg(test)]
mod write_tests;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DiskRecord, save_disks};
use crate::conn::{ConnEvent, ConnectionTable, spawn_dial};
use crate::disk::{DiskEvent, DiskHandle, spawn_executor};
use crate::error::BlockError;
use crate::fs::Mutation;
use crate::mapper::{ClusterState, NodeConnectionMapper};
use crate::placement::MirrorDistributor;
use crate::types::{BlockId, ConnId, DiskId, NodeId};
use crate::wire::Payload;

pub use client::{BlockClient, BlockRequest};
pub use read::{GetReply, GetStep, GetTracker};
pub use write::{PutOutcome, PutReply, PutTracker};

/// DEFAULT_DISK_WEIGHT is the placement weight of a freshly added disk.
pub const DEFAULT_DISK_WEIGHT: u32 = 1;

/// Command is an administrative request.
#[derive(Debug)]
pub enum Command {
    AddDisk {
        path: PathBuf,
        reply: oneshot::Sender<anyhow::Result<DiskId>>,
    },
    ConnectTo {
        address: String,
    },
    ConnectionStatus {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
}

/// PeerStatus is one live, handshaken peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub node_id: NodeId,
    pub address: String,
}

/// ManagerSetup is the state a manager starts from.
#[derive(Debug)]
pub struct ManagerSetup {
    pub node_id: NodeId,
    /// Address peers are told to dial.
    pub address: String,
    pub config_dir: PathBuf,
    pub channel_capacity: usize,
    pub disks: Vec<DiskRecord>,
    pub mapper: NodeConnectionMapper,
}

/// ManagerParts are the channel ends the rest of the node holds.
pub struct ManagerParts {
    pub commands: mpsc::Sender<Command>,
    pub blocks: BlockClient,
    pub remote_mutations: mpsc::UnboundedReceiver<Mutation>,
    pub conn_events: mpsc::Sender<ConnEvent>,
    pub candidates: watch::Receiver<Vec<String>>,
    pub cluster: watch::Receiver<ClusterState>,
    pub task: JoinHandle<()>,
}

struct Inputs {
    commands: mpsc::Receiver<Command>,
    conn_events: mpsc::Receiver<ConnEvent>,
    disk_events: mpsc::UnboundedReceiver<DiskEvent>,
    block_requests: mpsc::Receiver<BlockRequest>,
    shutdown: watch::Receiver<bool>,
}

pub struct Manager {
    node_id: NodeId,
    address: String,
    config_dir: PathBuf,
    capacity: usize,

    mapper: NodeConnectionMapper,
    distributor: MirrorDistributor,
    disks: HashMap<DiskId, DiskHandle>,
    disk_records: Vec<DiskRecord>,
    disk_tasks: Vec<JoinHandle<()>>,
    conns: ConnectionTable,
    dialing: HashSet<String>,

    puts: PutTracker,
    gets: GetTracker,

    conn_events: mpsc::Sender<ConnEvent>,
    disk_events: mpsc::UnboundedSender<DiskEvent>,
    remote_mutations: mpsc::UnboundedSender<Mutation>,
    candidates: watch::Sender<Vec<String>>,
    cluster: watch::Sender<ClusterState>,
    shutdown: watch::Receiver<bool>,
}

/// `spawn_manager` starts the event loop and the executors of every disk in
/// `setup`.
pub fn spawn_manager(setup: ManagerSetup, shutdown: watch::Receiver<bool>) -> ManagerParts {
    let capacity = setup.channel_capacity.max(1);
    let (commands_tx, commands_rx) = mpsc::channel(capacity);
    let (conn_tx, conn_rx) = mpsc::channel(capacity);
    let (disk_tx, disk_rx) = mpsc::unbounded_channel();
    let (block_tx, block_rx) = mpsc::channel(capacity);
    let (mutations_tx, mutations_rx) = mpsc::unbounded_channel();
    let (candidates_tx, candidates_rx) = watch::channel(setup.mapper.reconnect_candidates());
    let (cluster_tx, cluster_rx) = watch::channel(setup.mapper.to_state());

    let mut manager = Manager {
        node_id: setup.node_id,
        address: setup.address,
        config_dir: setup.config_dir,
        capacity,
        mapper: setup.mapper,
        distributor: MirrorDistributor::new(),
        disks: HashMap::new(),
        disk_records: Vec::new(),
        disk_tasks: Vec::new(),
        conns: ConnectionTable::new(conn_tx.clone(), shutdown.clone()),
        dialing: HashSet::new(),
        puts: PutTracker::new(),
        gets: GetTracker::new(),
        conn_events: conn_tx.clone(),
        disk_events: disk_tx,
        remote_mutations: mutations_tx,
        candidates: candidates_tx,
        cluster: cluster_tx,
        shutdown: shutdown.clone(),
    };
    for record in setup.disks {
        manager.start_disk(record);
    }

    let inputs = Inputs {
        commands: commands_rx,
        conn_events: conn_rx,
        disk_events: disk_rx,
        block_requests: block_rx,
        shutdown,
    };
    let task = tokio::spawn(manager.run(inputs));

    ManagerParts {
        commands: commands_tx,
        blocks: BlockClient::new(block_tx),
        remote_mutations: mutations_rx,
        conn_events: conn_tx,
        candidates: candidates_rx,
        cluster: cluster_rx,
        task,
    }
}

impl Manager {
    async fn run(mut self, mut inputs: Inputs) {
        info!(
            "manager: node {} at {} with {} disks",
            self.node_id,
            self.address,
            self.disks.len()
        );
        for address in self.mapper.reconnect_candidates() {
            self.connect_to(address);
        }

        loop {
            tokio::select! {
                changed = inputs.shutdown.changed() => {
                    if changed.is_err() || *inputs.shutdown.borrow() {
                        info!("manager: shutdown requested");
                        break;
                    }
                },
                Some(cmd) = inputs.commands.recv() => self.on_command(cmd).await,
                Some(event) = inputs.conn_events.recv() => self.on_conn_event(event).await,
                Some(event) = inputs.disk_events.recv() => self.on_disk_event(event).await,
                Some(req) = inputs.block_requests.recv() => self.on_block_request(req).await,
                else => break,
            }
        }

        self.puts.fail_all(&BlockError::Stopped);
        self.gets.fail_all(&BlockError::Stopped);
        self.conns.close_all();
        for task in self.disk_tasks.drain(..) {
            let _ = task.await;
        }
        info!("manager: stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddDisk { path, reply } => {
                let result = self.add_disk(path).await;
                if let Err(err) = &result {
                    warn!("manager: add disk failed: {err:#}");
                }
                let _ = reply.send(result);
            }
            Command::ConnectTo { address } => self.connect_to(address),
            Command::ConnectionStatus { reply } => {
                let peers = self
                    .mapper
                    .connected_peers()
                    .into_iter()
                    .map(|(node_id, address, _)| PeerStatus { node_id, address })
                    .collect();
                let _ = reply.send(peers);
            }
        }
    }

    async fn on_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Accepted { stream, peer } => {
                let conn = self.conns.register(stream);
                self.mapper.register_conn(conn, None);
                debug!("manager: {conn} accepted from {peer}");
                self.send_iam(conn);
            }
            ConnEvent::Dialed { stream, address } => {
                self.dialing.remove(&address);
                let conn = self.conns.register(stream);
                self.mapper.register_conn(conn, Some(address.clone()));
                debug!("manager: {conn} dialed {address}");
                self.send_iam(conn);
            }
            ConnEvent::DialFailed { address, error } => {
                self.dialing.remove(&address);
                debug!("manager: dial {address} failed: {error}");
            }
            ConnEvent::Received { conn, payload } => self.on_payload(conn, payload).await,
            ConnEvent::Lost { conn } => self.on_lost(conn).await,
        }
    }

    async fn on_payload(&mut self, conn: ConnId, payload: Payload) {
        if !self.mapper.is_handshaken(conn) && !matches!(payload, Payload::IAm { .. }) {
            debug!(
                "manager: {conn} sent tag {} before I-AM, dropping",
                payload.tag()
            );
            return;
        }
        match payload {
            Payload::IAm {
                node_id,
                address,
                disks,
            } => self.on_iam(conn, node_id, address, &disks),
            Payload::SyncNodes { nodes } => self.on_sync_nodes(nodes),
            Payload::WriteRequest {
                caller,
                put_id,
                dest,
                block,
            } => self.on_remote_write(caller, put_id, dest, block).await,
            Payload::WriteResult {
                put_id,
                dest,
                result,
                ..
            } => {
                self.on_write_result(&put_id, &dest, result.map_err(BlockError::Remote));
            }
            Payload::ReadRequest {
                caller,
                get_id,
                ptr,
            } => self.on_remote_read(caller, get_id, ptr).await,
            Payload::ReadResult {
                get_id,
                ptr,
                result,
                ..
            } => {
                self.on_read_result(&get_id, &ptr, result.map_err(BlockError::Remote))
                    .await;
            }
            Payload::Broadcast(mutation) => {
                if self.remote_mutations.send(mutation).is_err() {
                    debug!("manager: filesystem gone, dropping broadcast");
                }
            }
        }
    }

    async fn on_lost(&mut self, conn: ConnId) {
        self.conns.close(conn);
        let Some(node_id) = self.mapper.remove_conn(conn) else {
            debug!("manager: {conn} lost before I-AM");
            return;
        };
        info!("manager: lost {conn} to {node_id}");
        if self.mapper.conn_for_node(&node_id).is_none() {
            let failed = self.puts.fail_node(&node_id);
            if !failed.is_empty() {
                warn!("manager: failed {} puts waiting on {node_id}", failed.len());
            }
            self.fail_gets_on(&node_id).await;
        }
        self.publish_membership();
    }

    async fn on_disk_event(&mut self, event: DiskEvent) {
        match event {
            DiskEvent::Written {
                caller,
                put_id,
                dest,
                result,
            } => {
                if caller == self.node_id {
                    self.on_write_result(&put_id, &dest, result.map_err(BlockError::Io));
                } else {
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
                }
            }
            DiskEvent::Read {
                caller,
                get_id,
                ptr,
                result,
            } => {
                if caller == self.node_id {
                    self.on_read_result(&get_id, &ptr, result.map_err(BlockError::Io))
                        .await;
                } else {
                    let to = caller.clone();
                    self.send_to_node(
                        &to,
                        Payload::ReadResult {
                            caller,
                            get_id,
                            ptr,
                            result,
                        },
                    );
                }
            }
        }
    }

    async fn on_block_request(&mut self, req: BlockRequest) {
        match req {
            BlockRequest::Put { block, reply } => self.start_put(block, reply).await,
            BlockRequest::Get { block_id, reply } => self.start_get(block_id, reply).await,
            BlockRequest::Broadcast(mutation) => self.broadcast(&Payload::Broadcast(mutation)),
            BlockRequest::Collect(block_id) => self.collect(block_id),
        }
    }

    async fn add_disk(&mut self, path: PathBuf) -> anyhow::Result<DiskId> {
        if let Some(existing) = self.disk_records.iter().find(|r| r.path == path) {
            return Ok(existing.disk_id.clone());
        }
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create disk directory {}", path.display()))?;

        let record = DiskRecord {
            disk_id: DiskId::generate(),
            path,
            node_id: self.node_id.clone(),
        };
        let mut records = self.disk_records.clone();
        records.push(record.clone());
        save_disks(&self.config_dir, &records).await?;

        let disk_id = record.disk_id.clone();
        info!("manager: added disk {disk_id} at {}", record.path.display());
        self.start_disk(record);
        self.announce();
        Ok(disk_id)
    }

    fn start_disk(&mut self, record: DiskRecord) {
        let (handle, task) = spawn_executor(
            record.disk_id.clone(),
            record.path.clone(),
            self.capacity,
            self.disk_events.clone(),
            self.shutdown.clone(),
        );
        self.distributor
            .set_weight(&self.node_id, &record.disk_id, DEFAULT_DISK_WEIGHT);
        self.disks.insert(record.disk_id.clone(), handle);
        self.disk_tasks.push(task);
        self.disk_records.push(record);
    }

    fn connect_to(&mut self, address: String) {
        if address == self.address {
            return;
        }
        let connected = self
            .mapper
            .connected_peers()
            .iter()
            .any(|(_, peer, _)| *peer == address);
        if connected || !self.dialing.insert(address.clone()) {
            return;
        }
        if self.mapper.add_address(&address) {
            self.publish_membership();
        }
        debug!("manager: dialing {address}");
        spawn_dial(address, self.conn_events.clone());
    }

    fn send_to_node(&self, node_id: &NodeId, payload: Payload) -> bool {
        let sent = self
            .mapper
            .conn_for_node(node_id)
            .is_some_and(|conn| self.conns.send(conn, payload).is_ok());
        if !sent {
            debug!("manager: no route to {node_id}, dropping reply");
        }
        sent
    }

    fn broadcast(&self, payload: &Payload) {
        for (node_id, _, conn) in self.mapper.connected_peers() {
            if self.conns.send(conn, payload.clone()).is_err() {
                debug!("manager: broadcast to {node_id} failed");
            }
        }
    }

    /// `collect` removes local replicas of `block_id` in the background.
    fn collect(&self, block_id: BlockId) {
        let disks: Vec<DiskHandle> = self.disks.values().cloned().collect();
        tokio::spawn(async move {
            for disk in disks {
                if !disk.exists(block_id.clone()).await {
                    continue;
                }
                match disk.delete(block_id.clone()).await {
                    Ok(()) => debug!("manager: collected {block_id} from {}", disk.disk_id()),
                    Err(err) => warn!("manager: collecting {block_id} failed: {err}"),
                }
            }
        });
    }

    fn publish_membership(&self) {
        let state = self.mapper.to_state();
        self.cluster.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        let candidates = self.mapper.reconnect_candidates();
        self.candidates.send_if_modified(|current| {
            if *current == candidates {
                return false;
            }
            *current = candidates;
            true
        });
    }
}
