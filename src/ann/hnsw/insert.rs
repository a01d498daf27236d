//! HNSW insertion: bidirectional linking with heuristic neighbor pruning
//! (Algorithm 4 from the HNSW paper).

use crate::ann::distance::l2_sq;
use crate::ann::hnsw::graph::HnswGraph;
use crate::ann::hnsw::search::search_layer;
use crate::ann::hnsw::visited::VisitedSet;
use std::cell::RefCell;

thread_local! {
    /// Reused traversal scratch; avoids a per-insert allocation.
    static INSERT_SCRATCH: RefCell<VisitedSet> = RefCell::new(VisitedSet::default());
}

impl HnswGraph {
    /// Insert a vector under `label`.
    ///
    /// Labels must be unique within the graph; inserting a duplicate label
    /// replaces nothing and panics in debug builds.
    pub fn insert(&mut self, label: u32, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dimension);
        debug_assert!(!self.label_to_node.contains_key(&label));
        let level = self.random_level();
        let node = self.node_count() as u32;

        // First node: no links to build
        if self.entry_point.is_none() {
            self.push_node(node, label, vector, level);
            self.entry_point = Some(node);
            self.max_level = level;
            return;
        }

        let entry_point = self.entry_point.expect("checked above");
        let top = level.min(self.max_level);

        let node_neighbors = INSERT_SCRATCH.with(|cell| {
            let mut visited = cell.borrow_mut();

            // Phase 1: greedy descent from the top layer to level + 1
            let mut current_ep = entry_point;
            for layer in (level + 1..=self.max_level).rev() {
                let found = search_layer(
                    self,
                    vector,
                    std::slice::from_ref(&current_ep),
                    1,
                    layer,
                    &mut visited,
                    false,
                );
                if let Some(&(_, nearest)) = found.first() {
                    current_ep = nearest;
                }
            }

            // Phase 2: collect candidate neighbors per layer
            let mut per_layer: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
            let mut layer_eps: Vec<u32> = vec![current_ep];
            for layer in (0..=top).rev() {
                let candidates = search_layer(
                    self,
                    vector,
                    &layer_eps,
                    self.params.ef_construction,
                    layer,
                    &mut visited,
                    false,
                );
                let m_max = if layer == 0 {
                    self.params.m_max0
                } else {
                    self.params.m
                };
                per_layer[layer] = self
                    .select_neighbors(&candidates, m_max)
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect();

                layer_eps.clear();
                layer_eps.extend(candidates.iter().map(|&(_, id)| id));
                if layer_eps.is_empty() {
                    layer_eps.push(entry_point);
                }
            }
            per_layer
        });

        self.push_node(node, label, vector, level);
        self.neighbors[node as usize] = node_neighbors;

        // Phase 3: backlinks with pruning when a neighbor overflows
        for layer in 0..=top {
            let m_max = if layer == 0 {
                self.params.m_max0
            } else {
                self.params.m
            };
            let links: Vec<u32> = self.neighbors[node as usize][layer].clone();
            for neighbor in links {
                let nid = neighbor as usize;
                while self.neighbors[nid].len() <= layer {
                    self.neighbors[nid].push(Vec::new());
                }
                self.neighbors[nid][layer].push(node);

                if self.neighbors[nid][layer].len() > m_max {
                    let base = self.vector(neighbor);
                    let candidates: Vec<(f32, u32)> = self.neighbors[nid][layer]
                        .iter()
                        .map(|&cid| (l2_sq(base, self.vector(cid)), cid))
                        .collect();
                    let pruned = self.select_neighbors(&candidates, m_max);
                    self.neighbors[nid][layer] = pruned.into_iter().map(|(_, id)| id).collect();
                }
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(node);
        }
    }

    fn push_node(&mut self, node: u32, label: u32, vector: &[f32], level: usize) {
        self.vectors.extend_from_slice(vector);
        self.labels.push(label);
        self.label_to_node.insert(label, node);
        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.levels.push(level as u8);
        self.deleted.push(false);
    }

    /// Heuristic neighbor selection: keep a candidate only when it is
    /// closer to the base point than to any already-selected neighbor,
    /// which favors diverse links over tight clusters. Falls back to the
    /// closest unused candidates if the heuristic leaves slots unfilled.
    fn select_neighbors(&self, candidates: &[(f32, u32)], m: usize) -> Vec<(f32, u32)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
        for &(dist_to_base, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            let cid_vec = self.vector(cid);
            let diverse = selected.iter().all(|&(_, sid)| {
                let dist_to_selected = l2_sq(cid_vec, self.vector(sid));
                dist_to_base <= dist_to_selected
            });
            if diverse {
                selected.push((dist_to_base, cid));
            }
        }

        if selected.len() < m {
            for &(dist, cid) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(_, id)| id == cid) {
                    selected.push((dist, cid));
                }
            }
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::hnsw::graph::HnswParams;

    fn grid_vector(i: usize, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|d| ((i * 31 + d * 7) % 101) as f32 / 101.0)
            .collect()
    }

    #[test]
    fn test_insert_builds_connected_graph() {
        let dim = 8;
        let mut g = HnswGraph::new(
            dim,
            HnswParams {
                m: 8,
                m_max0: 16,
                ef_construction: 40,
                ef_search: 20,
                max_layers: 8,
            },
        );
        for i in 0..100u32 {
            g.insert(i, &grid_vector(i as usize, dim));
        }
        assert_eq!(g.node_count(), 100);
        assert!(g.entry_point.is_some());
        // Every node above the first should have at least one layer-0 link
        for node in 1..100usize {
            assert!(
                !g.neighbors[node][0].is_empty() || g.neighbors.iter().any(|n| n[0].contains(&(node as u32))),
                "node {node} is isolated"
            );
        }
    }

    #[test]
    fn test_neighbor_lists_respect_capacity() {
        let dim = 4;
        let params = HnswParams {
            m: 4,
            m_max0: 8,
            ef_construction: 32,
            ef_search: 16,
            max_layers: 6,
        };
        let mut g = HnswGraph::new(dim, params);
        for i in 0..200u32 {
            g.insert(i, &grid_vector(i as usize, dim));
        }
        for (node, per_layer) in g.neighbors.iter().enumerate() {
            for (layer, links) in per_layer.iter().enumerate() {
                let cap = if layer == 0 { 8 } else { 4 };
                assert!(
                    links.len() <= cap,
                    "node {node} layer {layer} has {} links (cap {cap})",
                    links.len()
                );
            }
        }
    }
}
