//! One running TealFS node: every long-lived task plus the handles the
//! outer surfaces use.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{CLUSTER_FILE, NodeConfig, load_disks, load_or_create_node_id, read_json};
use crate::conn::run_listener;
use crate::fs::persist::{INDEX_FILE, load_index};
use crate::fs::{FileSystem, spawn_filesystem};
use crate::manager::{Command, ManagerSetup, PeerStatus, spawn_manager};
use crate::mapper::{ClusterState, NodeConnectionMapper, run_cluster_saver};
use crate::reconnect::run_reconnector;
use crate::types::{DiskId, NodeId};

pub struct Node {
    id: NodeId,
    address: String,
    fs: FileSystem,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Node {
    /// `start` loads the node's persisted state from the config directory,
    /// binds the node-to-node listener and spawns every task.
    ///
    /// A configured port of 0 advertises the port the OS picked.
    ///
    /// # Errors
    /// Returns an error if persisted state cannot be read or the listener
    /// cannot be bound.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.config_dir)
            .await
            .with_context(|| format!("failed to create {}", config.config_dir.display()))?;

        let id = load_or_create_node_id(&config.config_dir).await?;
        let disks = load_disks(&config.config_dir).await?;
        let cluster: ClusterState = read_json(&config.path(CLUSTER_FILE))
            .await?
            .unwrap_or_default();
        let index = load_index(&config.path(INDEX_FILE)).await?;

        let listener = TcpListener::bind(&config.node_address)
            .await
            .with_context(|| format!("failed to bind {}", config.node_address))?;
        let address = advertised_address(&config.node_address, listener.local_addr()?);
        info!(
            "node: {id} listening on {address}, {} disks, {} known peers, {} entries",
            disks.len(),
            cluster.nodes.len(),
            index.len()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let parts = spawn_manager(
            ManagerSetup {
                node_id: id.clone(),
                address: address.clone(),
                config_dir: config.config_dir.clone(),
                channel_capacity: config.channel_capacity,
                disks,
                mapper: NodeConnectionMapper::from_state(&cluster),
            },
            shutdown_rx.clone(),
        );

        let (fs, fs_task) = spawn_filesystem(
            index,
            config.path(INDEX_FILE),
            parts.blocks.clone(),
            parts.remote_mutations,
            config.channel_capacity,
            shutdown_rx.clone(),
        );

        let listener_task = tokio::spawn(run_listener(
            listener,
            parts.conn_events.clone(),
            shutdown_rx.clone(),
        ));
        let reconnect_task = tokio::spawn(run_reconnector(
            parts.commands.clone(),
            parts.candidates,
            config.reconnect_interval,
            config.reconnect_jitter_ratio,
            shutdown_rx.clone(),
        ));
        let saver_task = tokio::spawn(run_cluster_saver(
            config.path(CLUSTER_FILE),
            parts.cluster,
            shutdown_rx,
        ));

        Ok(Self {
            id,
            address,
            fs,
            commands: parts.commands,
            shutdown,
            tasks: Mutex::new(vec![
                ("listener", listener_task),
                ("reconnect", reconnect_task),
                ("fs", fs_task),
                ("manager", parts.task),
                ("cluster", saver_task),
            ]),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// `address` is the node-to-node address peers are told to dial.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn filesystem(&self) -> FileSystem {
        self.fs.clone()
    }

    /// `add_disk` attaches a directory as local block storage. Adding a path
    /// twice returns the existing disk.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or `disks.json`
    /// cannot be written.
    pub async fn add_disk(&self, path: impl Into<PathBuf>) -> Result<DiskId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::AddDisk {
                path: path.into(),
                reply,
            })
            .await
            .map_err(|_| anyhow!("node is shutting down"))?;
        rx.await.map_err(|_| anyhow!("node is shutting down"))?
    }

    /// `connect_to` remembers `address` and dials it in the background.
    ///
    /// # Errors
    /// Returns an error once the node is shutting down.
    pub async fn connect_to(&self, address: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::ConnectTo {
                address: address.into(),
            })
            .await
            .map_err(|_| anyhow!("node is shutting down"))
    }

    /// `connection_status` lists handshaken peers. The local node is never
    /// part of it.
    ///
    /// # Errors
    /// Returns an error once the node is shutting down.
    pub async fn connection_status(&self) -> Result<Vec<PeerStatus>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ConnectionStatus { reply })
            .await
            .map_err(|_| anyhow!("node is shutting down"))?;
        rx.await.map_err(|_| anyhow!("node is shutting down"))
    }

    /// `shutdown_signal` hands out a receiver that flips once `shutdown`
    /// starts, for surfaces that stop together with the node.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// `shutdown` stops every task and waits for them; the filesystem index
    /// and cluster state are saved on the way out. Later calls return at once.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }
        for (name, task) in tasks {
            if let Err(err) = task.await {
                warn!("node: {name} task failed: {err}");
            }
        }
        info!("node: {} stopped", self.id);
    }
}

fn advertised_address(configured: &str, bound: SocketAddr) -> String {
    match configured.parse::<SocketAddr>() {
        Ok(addr) if addr.port() == 0 => bound.to_string(),
        _ => configured.to_string(),
    }
}
