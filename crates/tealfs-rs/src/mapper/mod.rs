//! Three-way association between connections, node ids and addresses.

#[cfg(test)]
mod mapper_tests;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::write_json;
use crate::types::{ConnId, NodeId};

#[derive(Debug, Default, Clone)]
struct ConnEntry {
    node_id: Option<NodeId>,
    address: Option<String>,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    address: String,
    conn: Option<ConnId>,
}

/// NodeConnectionMapper tracks which connection belongs to which node and
/// which addresses still need a connection.
///
/// A connection maps to at most one node and one address; a node has at
/// most one live connection. Known nodes without a connection, and dialed
/// addresses that never completed a handshake, are reconnection candidates.
#[derive(Debug, Default)]
pub struct NodeConnectionMapper {
    conns: HashMap<ConnId, ConnEntry>,
    nodes: BTreeMap<NodeId, NodeEntry>,
    addresses: BTreeSet<String>,
}

/// ClusterState is the `cluster.json` document.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    #[serde(default)]
    pub nodes: Vec<KnownNode>,
    /// Addresses added by connect-to that never answered with an I-AM.
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownNode {
    pub node_id: NodeId,
    pub address: String,
}

impl NodeConnectionMapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_state(state: &ClusterState) -> Self {
        let mut mapper = Self::new();
        for node in &state.nodes {
            mapper.nodes.insert(
                node.node_id.clone(),
                NodeEntry {
                    address: node.address.clone(),
                    conn: None,
                },
            );
        }
        for address in &state.addresses {
            if !mapper.nodes.values().any(|n| &n.address == address) {
                mapper.addresses.insert(address.clone());
            }
        }
        mapper
    }

    #[must_use]
    pub fn to_state(&self) -> ClusterState {
        ClusterState {
            nodes: self
                .nodes
                .iter()
                .map(|(node_id, entry)| KnownNode {
                    node_id: node_id.clone(),
                    address: entry.address.clone(),
                })
                .collect(),
            addresses: self.addresses.iter().cloned().collect(),
        }
    }

    /// `add_address` records an address to dial. Returns `false` when the
    /// address already belongs to a known node or is already pending.
    pub fn add_address(&mut self, address: &str) -> bool {
        if self.nodes.values().any(|n| n.address == address) {
            return false;
        }
        self.addresses.insert(address.to_string())
    }

    /// `register_conn` records a fresh connection that has not sent I-AM yet.
    pub fn register_conn(&mut self, conn: ConnId, address: Option<String>) {
        self.conns.insert(
            conn,
            ConnEntry {
                node_id: None,
                address,
            },
        );
    }

    /// `bind` completes the handshake of `conn`: it now speaks for `node_id`
    /// reachable at `address`. Returns the connection the node previously
    /// held, if it differs from `conn`.
    pub fn bind(&mut self, conn: ConnId, node_id: &NodeId, address: &str) -> Option<ConnId> {
        let dialed = self
            .conns
            .get(&conn)
            .and_then(|entry| entry.address.clone());
        if let Some(dialed) = &dialed {
            self.addresses.remove(dialed);
        }
        self.addresses.remove(address);

        // Another node id at the same address is a restarted peer that lost
        // its identity; forget it.
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, entry)| *id != node_id && entry.address == address)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            debug!("mapper: node {id} replaced by {node_id} at {address}");
            self.nodes.remove(&id);
        }

        let entry = self.conns.entry(conn).or_default();
        entry.node_id = Some(node_id.clone());
        if entry.address.is_none() {
            entry.address = Some(address.to_string());
        }

        let previous = self.nodes.insert(
            node_id.clone(),
            NodeEntry {
                address: address.to_string(),
                conn: Some(conn),
            },
        );
        match previous.and_then(|p| p.conn) {
            Some(old) if old != conn && self.conns.contains_key(&old) => Some(old),
            _ => None,
        }
    }

    /// `remove_conn` forgets a connection. The node it belonged to stays known
    /// and becomes a reconnection candidate. Returns that node.
    pub fn remove_conn(&mut self, conn: ConnId) -> Option<NodeId> {
        let entry = self.conns.remove(&conn)?;
        match entry.node_id {
            Some(node_id) => {
                if let Some(node) = self.nodes.get_mut(&node_id) {
                    if node.conn == Some(conn) {
                        node.conn = None;
                    }
                }
                Some(node_id)
            }
            None => None,
        }
    }

    /// `discard_conn` forgets a connection together with the address it was
    /// dialed at, e.g. after dialing ourselves.
    pub fn discard_conn(&mut self, conn: ConnId) {
        if let Some(entry) = self.conns.remove(&conn) {
            if let Some(address) = entry.address {
                self.addresses.remove(&address);
            }
        }
    }

    #[must_use]
    pub fn node_for_conn(&self, conn: ConnId) -> Option<&NodeId> {
        self.conns.get(&conn).and_then(|e| e.node_id.as_ref())
    }

    #[must_use]
    pub fn conn_for_node(&self, node_id: &NodeId) -> Option<ConnId> {
        self.nodes.get(node_id).and_then(|n| n.conn)
    }

    #[must_use]
    pub fn is_known(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// `is_handshaken` reports whether `conn` has delivered its I-AM.
    #[must_use]
    pub fn is_handshaken(&self, conn: ConnId) -> bool {
        self.node_for_conn(conn).is_some()
    }

    /// `reconnect_candidates` lists addresses without a live connection.
    #[must_use]
    pub fn reconnect_candidates(&self) -> Vec<String> {
        let mut out: BTreeSet<String> = self.addresses.clone();
        for entry in self.nodes.values() {
            if entry.conn.is_none() {
                out.insert(entry.address.clone());
            }
        }
        out.into_iter().collect()
    }

    /// `known_nodes` lists every `(node, address)` pair, connected or not.
    #[must_use]
    pub fn known_nodes(&self) -> Vec<(NodeId, String)> {
        self.nodes
            .iter()
            .map(|(id, entry)| (id.clone(), entry.address.clone()))
            .collect()
    }

    /// `connected_peers` lists handshaken nodes with a live connection.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<(NodeId, String, ConnId)> {
        self.nodes
            .iter()
            .filter_map(|(id, entry)| entry.conn.map(|c| (id.clone(), entry.address.clone(), c)))
            .collect()
    }
}

/// `run_cluster_saver` writes every published cluster state to `path`.
/// Bursts of membership changes collapse into the latest value.
pub async fn run_cluster_saver(
    path: PathBuf,
    mut states: watch::Receiver<ClusterState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                if let Err(err) = write_json(&path, &state).await {
                    warn!("cluster: save failed: {err:#}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            },
        }
    }

    let state = states.borrow().clone();
    if let Err(err) = write_json(&path, &state).await {
        warn!("cluster: final save failed: {err:#}");
    }
    debug!("cluster: saver stopped");
}
