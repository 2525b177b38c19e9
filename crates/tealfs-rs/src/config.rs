//! Node configuration and the small JSON/text files kept in the config directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{DiskId, NodeId};

/// DISKS_FILE lists the local node's attached disks.
pub const DISKS_FILE: &str = "disks.json";
/// CLUSTER_FILE holds the serialized connection mapper.
pub const CLUSTER_FILE: &str = "cluster.json";
/// NODE_ID_FILE keeps the node id stable across restarts.
pub const NODE_ID_FILE: &str = "node_id";

/// NodeConfig carries everything `Node::start` needs.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub config_dir: PathBuf,
    /// Bind address of the node-to-node listener. Port 0 picks a free port;
    /// the bound address is what peers are told.
    pub node_address: String,
    pub reconnect_interval: Duration,
    pub reconnect_jitter_ratio: f64,
    pub channel_capacity: usize,
}

impl NodeConfig {
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>, node_address: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            node_address: node_address.into(),
            reconnect_interval: Duration::from_secs(5),
            reconnect_jitter_ratio: 0.2,
            channel_capacity: 1024,
        }
    }

    #[must_use]
    pub fn path(&self, file: &str) -> PathBuf {
        self.config_dir.join(file)
    }
}

/// DiskRecord is one entry of `disks.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskRecord {
    pub disk_id: DiskId,
    pub path: PathBuf,
    pub node_id: NodeId,
}

/// `write_atomic` writes to a sibling temp file and renames it over `path`.
///
/// # Errors
/// Returns an error if the temp file cannot be written or renamed.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// `read_json` parses `path`, returning `None` when it does not exist.
///
/// # Errors
/// Returns an error if the file exists but is unreadable or malformed.
pub async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// `write_json` pretty-prints `value` to `path` atomically.
///
/// # Errors
/// Returns an error if serialization or the write fails.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize json")?;
    write_atomic(path, &bytes).await
}

/// `load_or_create_node_id` reads the persisted node id or mints a new one.
///
/// # Errors
/// Returns an error if the id file cannot be read or written.
pub async fn load_or_create_node_id(config_dir: &Path) -> Result<NodeId> {
    let path = config_dir.join(NODE_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) if !raw.trim().is_empty() => return Ok(NodeId(raw.trim().to_string())),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    }
    let id = NodeId::generate();
    write_atomic(&path, id.as_str().as_bytes()).await?;
    Ok(id)
}

pub async fn load_disks(config_dir: &Path) -> Result<Vec<DiskRecord>> {
    Ok(read_json(&config_dir.join(DISKS_FILE))
        .await?
        .unwrap_or_default())
}

pub async fn save_disks(config_dir: &Path, disks: &[DiskRecord]) -> Result<()> {
    write_json(&config_dir.join(DISKS_FILE), &disks).await
}
