//! Weighted, deterministic replica placement.
//!
//! Every node holding the same weight map computes the same pointer lists,
//! so no coordination is needed to agree on where a block lives.


use std::collections::BTreeMap;

use crate::types::{BlockId, DiskId, DiskInfo, DiskPointer, NodeId};

/// REPLICAS is how many pointers a write targets.
pub const REPLICAS: usize = 2;

#[derive(Clone, Debug)]
struct Candidate {
    node_id: NodeId,
    disk_id: DiskId,
    weight: u32,
}

/// MirrorDistributor maps a block id to an ordered list of disk pointers.
///
/// Candidates are kept sorted by their `"{node}|{disk}"` key, which is the
/// tie-break that keeps the choice identical on every node.
#[derive(Clone, Debug, Default)]
pub struct MirrorDistributor {
    weights: BTreeMap<String, Candidate>,
}

impl MirrorDistributor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(node_id: &NodeId, disk_id: &DiskId) -> String {
        format!("{node_id}|{disk_id}")
    }

    /// `set_weight` registers a disk. A zero weight removes it.
    pub fn set_weight(&mut self, node_id: &NodeId, disk_id: &DiskId, weight: u32) {
        let key = Self::key(node_id, disk_id);
        if weight == 0 {
            self.weights.remove(&key);
            return;
        }
        self.weights.insert(
            key,
            Candidate {
                node_id: node_id.clone(),
                disk_id: disk_id.clone(),
                weight,
            },
        );
    }

    /// `set_node_disks` replaces every disk of `node_id` with `disks`.
    pub fn set_node_disks(&mut self, node_id: &NodeId, disks: &[DiskInfo]) {
        self.remove_node(node_id);
        for disk in disks {
            self.set_weight(node_id, &disk.disk_id, disk.weight);
        }
    }

    pub fn remove_node(&mut self, node_id: &NodeId) {
        self.weights.retain(|_, c| &c.node_id != node_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// `disks_of` lists the disks and weights registered for `node_id`.
    #[must_use]
    pub fn disks_of(&self, node_id: &NodeId) -> Vec<DiskInfo> {
        self.weights
            .values()
            .filter(|c| &c.node_id == node_id)
            .map(|c| DiskInfo {
                disk_id: c.disk_id.clone(),
                weight: c.weight,
            })
            .collect()
    }

    /// `write_pointers_for` returns the (at most two) replicas a write targets.
    #[must_use]
    pub fn write_pointers_for(&self, block_id: &BlockId) -> Vec<DiskPointer> {
        let mut all = self.read_pointers_for(block_id);
        all.truncate(REPLICAS);
        all
    }

    /// `read_pointers_for` returns every candidate: the write replicas first,
    /// then the remaining disks in key order.
    #[must_use]
    pub fn read_pointers_for(&self, block_id: &BlockId) -> Vec<DiskPointer> {
        let hash = crc32fast::hash(block_id.as_str().as_bytes());
        let mut remaining: Vec<&Candidate> = self.weights.values().collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        for _ in 0..REPLICAS {
            let Some(index) = pick(&remaining, hash) else {
                break;
            };
            ordered.push(remaining.remove(index));
        }
        ordered.extend(remaining);

        ordered
            .into_iter()
            .map(|c| DiskPointer::new(c.node_id.clone(), c.disk_id.clone(), block_id))
            .collect()
    }
}

/// `pick` walks the running weight until it passes `hash mod total`.
fn pick(candidates: &[&Candidate], hash: u32) -> Option<usize> {
    let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return None;
    }
    let target = u64::from(hash) % total;
    let mut running = 0u64;
    for (i, c) in candidates.iter().enumerate() {
        running += u64::from(c.weight);
        if running > target {
            return Some(i);
        }
    }
    None
}
