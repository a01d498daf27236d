//! HNSW search: greedy single-layer traversal and multi-layer KNN.

use crate::ann::distance::l2_sq;
use crate::ann::hnsw::graph::HnswGraph;
use crate::ann::hnsw::visited::VisitedSet;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Search one layer, returning up to `ef` nearest candidates as
/// `(distance, node_id)` ascending.
///
/// With `skip_deleted`, tombstoned nodes are excluded from the result
/// set; they always participate in navigation.
pub fn search_layer(
    graph: &HnswGraph,
    query: &[f32],
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    skip_deleted: bool,
) -> Vec<(f32, u32)> {
    // Fresh traversal per call: nodes visited while descending an upper
    // layer must be revisitable here
    visited.reset(graph.node_count());

    // Candidates: min-heap by distance. Results: max-heap for cheap
    // worst-entry eviction.
    let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, u32)>> =
        BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(ef + 1);
    let mut worst = f32::MAX;

    for &ep in entry_points {
        if visited.first_visit(ep) {
            let dist = l2_sq(query, graph.vector(ep));
            candidates.push(Reverse((OrderedFloat(dist), ep)));
            if !(skip_deleted && graph.is_deleted(ep)) {
                results.push((OrderedFloat(dist), ep));
                if results.len() >= ef {
                    worst = results.peek().map_or(f32::MAX, |r| r.0 .0);
                }
            }
        }
    }

    while let Some(Reverse((OrderedFloat(c_dist), node))) = candidates.pop() {
        if results.len() >= ef && c_dist > worst {
            break;
        }
        let node_idx = node as usize;
        if layer >= graph.neighbors[node_idx].len() {
            continue;
        }
        for &neighbor in &graph.neighbors[node_idx][layer] {
            if !visited.first_visit(neighbor) {
                continue;
            }
            let dist = l2_sq(query, graph.vector(neighbor));
            if results.len() < ef || dist < worst {
                candidates.push(Reverse((OrderedFloat(dist), neighbor)));
                if !(skip_deleted && graph.is_deleted(neighbor)) {
                    results.push((OrderedFloat(dist), neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                    worst = results.peek().map_or(f32::MAX, |r| r.0 .0);
                }
            }
        }
    }

    let mut out: Vec<(f32, u32)> = results
        .into_sorted_vec()
        .into_iter()
        .map(|(d, id)| (d.0, id))
        .collect();
    out.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    out
}

impl HnswGraph {
    /// Multi-layer KNN search. Returns `(label, distance)` ascending by
    /// distance, tombstoned nodes filtered out.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let entry_point = match self.entry_point {
            Some(ep) => ep,
            None => return Vec::new(),
        };

        let mut visited = VisitedSet::default();

        // Greedy descent with ef = 1 down to layer 1
        let mut current_ep = entry_point;
        for layer in (1..=self.max_level).rev() {
            let found = search_layer(
                self,
                query,
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

        // Layer 0 with full ef, skipping tombstones in results
        let ef = self.params.ef_search.max(k);
        let found = search_layer(
            self,
            query,
            std::slice::from_ref(&current_ep),
            ef,
            0,
            &mut visited,
            true,
        );

        found
            .into_iter()
            .take(k)
            .map(|(dist, node)| (self.labels[node as usize], dist))
            .collect()
    }
}
