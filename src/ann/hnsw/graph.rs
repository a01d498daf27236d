//! HNSW graph structure and configuration.
//!
//! Struct-of-arrays layout: the vector arena, per-node neighbor lists,
//! level assignments, and tombstone flags are parallel arrays indexed by
//! node id. External labels map to node ids through `label_to_node`;
//! node ids are assigned densely in insertion order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tuning parameters for an HNSW graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswParams {
    /// Bidirectional links per node above layer 0.
    pub m: usize,
    /// Maximum links per node at layer 0 (typically `2 * m`).
    pub m_max0: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Candidate list size during search (higher = better recall, slower).
    pub ef_search: usize,
    /// Maximum number of layers.
    pub max_layers: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 32,
            m_max0: 64,
            ef_construction: 200,
            ef_search: 64,
            max_layers: 16,
        }
    }
}

/// Multi-layer proximity graph over a raw f32 vector arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    pub params: HnswParams,
    pub dimension: usize,
    /// Contiguous raw vector arena, one row per node.
    pub vectors: Vec<f32>,
    /// External label per node.
    pub labels: Vec<u32>,
    /// External label → node id.
    pub label_to_node: HashMap<u32, u32>,
    /// `[node][layer][neighbor node ids]`.
    pub neighbors: Vec<Vec<Vec<u32>>>,
    /// Top layer of each node.
    pub levels: Vec<u8>,
    /// Tombstoned nodes: excluded from results, kept for navigation.
    pub deleted: Vec<bool>,
    pub entry_point: Option<u32>,
    pub max_level: usize,
}

impl HnswGraph {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        Self {
            params,
            dimension,
            vectors: Vec::new(),
            labels: Vec::new(),
            label_to_node: HashMap::new(),
            neighbors: Vec::new(),
            levels: Vec::new(),
            deleted: Vec::new(),
            entry_point: None,
            max_level: 0,
        }
    }

    /// Total nodes including tombstones.
    pub fn node_count(&self) -> usize {
        self.labels.len()
    }

    /// Live (non-tombstoned) nodes.
    pub fn live_count(&self) -> usize {
        self.deleted.iter().filter(|&&d| !d).count()
    }

    /// Vector row for a node id.
    #[inline]
    pub fn vector(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    pub fn is_deleted(&self, node: u32) -> bool {
        self.deleted[node as usize]
    }

    /// Tombstone the node carrying `label`. Returns `true` if it existed
    /// and was live.
    pub fn mark_deleted(&mut self, label: u32) -> bool {
        match self.label_to_node.get(&label) {
            Some(&node) if !self.deleted[node as usize] => {
                self.deleted[node as usize] = true;
                true
            }
            _ => false,
        }
    }

    /// Reconstruct the vector stored under `label`.
    pub fn reconstruct(&self, label: u32) -> Option<Vec<f32>> {
        let &node = self.label_to_node.get(&label)?;
        if self.deleted[node as usize] {
            return None;
        }
        Some(self.vector(node).to_vec())
    }

    /// Sample a level from the standard exponential distribution,
    /// normalized by `1 / ln(M)`.
    pub fn random_level(&self) -> usize {
        let ml = 1.0 / (self.params.m as f64).ln();
        let r: f64 = rand::random();
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.params.max_layers - 1)
    }

    /// Estimated resident memory in bytes.
    pub fn memory_bytes(&self) -> usize {
        let mut total = self.vectors.len() * 4 + self.labels.len() * 4;
        for node_neighbors in &self.neighbors {
            for layer in node_neighbors {
                total += layer.len() * 4 + 24;
            }
            total += 24;
        }
        total += self.levels.len() + self.deleted.len();
        total += self.label_to_node.len() * 12;
        total
    }

    /// Live labels.
    pub fn labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.labels
            .iter()
            .enumerate()
            .filter(|(node, _)| !self.deleted[*node])
            .map(|(_, &label)| label)
    }
}
