//! IVF index: coarse quantizer + inverted lists of raw vectors.
//!
//! Vectors are assigned to their nearest coarse centroid at add time;
//! queries scan the `nprobe` nearest lists. Requires training before the
//! first add. Supports physical removal via in-list swap-remove.

use crate::ann::distance::l2_sq;
use crate::ann::kmeans::{kmeans, nearest_centroid};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};

/// One inverted list: labels plus a contiguous vector arena.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvertedList {
    pub labels: Vec<u32>,
    pub vectors: Vec<f32>,
}

/// Inverted-file index with a flat coarse quantizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfIndex {
    pub dimension: usize,
    pub nlist: usize,
    pub nprobe: usize,
    /// Coarse centroids, `nlist × dimension`. Empty until trained.
    pub centroids: Vec<f32>,
    pub lists: Vec<InvertedList>,
    /// label → (list index, position within list).
    pub locations: HashMap<u32, (u32, u32)>,
}

impl IvfIndex {
    pub fn new(dimension: usize, nlist: usize, nprobe: usize) -> Self {
        Self {
            dimension,
            nlist,
            nprobe: nprobe.clamp(1, nlist),
            centroids: Vec::new(),
            lists: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn size(&self) -> usize {
        self.locations.len()
    }

    /// Train the coarse quantizer on a sample arena.
    pub fn train(&mut self, samples: &[f32]) {
        self.centroids = kmeans(samples, self.dimension, self.nlist, 0x1f1f);
        self.lists = (0..self.nlist).map(|_| InvertedList::default()).collect();
    }

    /// Add one vector under `label`. The index must be trained.
    pub fn add(&mut self, label: u32, vector: &[f32]) {
        debug_assert!(self.is_trained());
        let list_idx = nearest_centroid(vector, &self.centroids, self.dimension);
        let list = &mut self.lists[list_idx];
        let pos = list.labels.len() as u32;
        list.labels.push(label);
        list.vectors.extend_from_slice(vector);
        self.locations.insert(label, (list_idx as u32, pos));
    }

    /// Physically remove the given labels. Returns the number removed.
    pub fn remove(&mut self, labels: &[u32]) -> usize {
        let mut removed = 0;
        for &label in labels {
            let Some((list_idx, pos)) = self.locations.remove(&label) else {
                continue;
            };
            let dim = self.dimension;
            let list = &mut self.lists[list_idx as usize];
            let last = list.labels.len() - 1;
            let pos = pos as usize;
            list.labels.swap_remove(pos);
            if pos != last {
                let (dst, src) = (pos * dim, last * dim);
                for d in 0..dim {
                    list.vectors[dst + d] = list.vectors[src + d];
                }
                // The moved label now lives at `pos`
                let moved = list.labels[pos];
                self.locations.insert(moved, (list_idx, pos as u32));
            }
            list.vectors.truncate(last * dim);
            removed += 1;
        }
        removed
    }

    /// Top-k search over the `nprobe` nearest lists, ascending by distance.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        if k == 0 || !self.is_trained() || self.locations.is_empty() {
            return Vec::new();
        }

        let probes = self.rank_lists(query);
        let mut heap: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(k + 1);
        for &list_idx in probes.iter().take(self.nprobe) {
            let list = &self.lists[list_idx];
            for (i, &label) in list.labels.iter().enumerate() {
                let row = &list.vectors[i * self.dimension..(i + 1) * self.dimension];
                let dist = l2_sq(query, row);
                heap.push((OrderedFloat(dist), label));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }

        let mut results: Vec<(u32, f32)> =
            heap.into_iter().map(|(d, label)| (label, d.0)).collect();
        results.sort_unstable_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results
    }

    /// Reconstruct the stored vector for `label`, if present.
    pub fn reconstruct(&self, label: u32) -> Option<Vec<f32>> {
        let &(list_idx, pos) = self.locations.get(&label)?;
        let list = &self.lists[list_idx as usize];
        let start = pos as usize * self.dimension;
        Some(list.vectors[start..start + self.dimension].to_vec())
    }

    /// Estimated resident memory in bytes.
    pub fn memory_bytes(&self) -> usize {
        let vectors: usize = self.lists.iter().map(|l| l.vectors.len() * 4).sum();
        let labels: usize = self.lists.iter().map(|l| l.labels.len() * 4).sum();
        vectors + labels + self.centroids.len() * 4 + self.locations.len() * 16
    }

    /// All stored labels.
    pub fn labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.locations.keys().copied()
    }

    /// List indexes ranked by centroid distance to the query.
    fn rank_lists(&self, query: &[f32]) -> Vec<usize> {
        let mut ranked: Vec<(f32, usize)> = (0..self.nlist)
            .map(|ci| {
                let centroid = &self.centroids[ci * self.dimension..(ci + 1) * self.dimension];
                (l2_sq(query, centroid), ci)
            })
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.into_iter().map(|(_, ci)| ci).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trained_index() -> IvfIndex {
        let dim = 4;
        let mut idx = IvfIndex::new(dim, 4, 4);
        // Training sample: spread over two regions
        let mut sample = Vec::new();
        for i in 0..40 {
            let base = if i % 2 == 0 { 0.0 } else { 5.0 };
            sample.extend_from_slice(&[
                base + (i % 5) as f32 * 0.1,
                base,
                base + 0.05,
                base + (i % 3) as f32 * 0.1,
            ]);
        }
        idx.train(&sample);
        idx
    }

    #[test]
    fn test_untrained_rejects_search() {
        let idx = IvfIndex::new(4, 4, 1);
        assert!(!idx.is_trained());
        assert!(idx.search(&[0.0; 4], 3).is_empty());
    }

    #[test]
    fn test_add_and_search() {
        let mut idx = trained_index();
        idx.add(1, &[0.0, 0.0, 0.0, 0.0]);
        idx.add(2, &[5.0, 5.0, 5.0, 5.0]);
        idx.add(3, &[0.1, 0.0, 0.0, 0.0]);

        let results = idx.search(&[0.0, 0.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
    }

    #[test]
    fn test_remove_fixes_moved_location() {
        let mut idx = trained_index();
        // Force all three into the same list region
        idx.add(1, &[0.0, 0.0, 0.0, 0.0]);
        idx.add(2, &[0.01, 0.0, 0.0, 0.0]);
        idx.add(3, &[0.02, 0.0, 0.0, 0.0]);

        assert_eq!(idx.remove(&[1]), 1);
        assert_eq!(idx.size(), 2);
        // Label 3 may have been swapped into label 1's slot; reconstruct must
        // still return its own vector.
        let v3 = idx.reconstruct(3).unwrap();
        assert!((v3[0] - 0.02).abs() < 1e-6);
        let results = idx.search(&[0.02, 0.0, 0.0, 0.0], 1);
        assert_eq!(results[0].0, 3);
    }

    #[test]
    fn test_remove_missing() {
        let mut idx = trained_index();
        idx.add(1, &[0.0; 4]);
        assert_eq!(idx.remove(&[42]), 0);
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn test_nprobe_clamped() {
        let idx = IvfIndex::new(4, 8, 100);
        assert_eq!(idx.nprobe, 8);
        let idx = IvfIndex::new(4, 8, 0);
        assert_eq!(idx.nprobe, 1);
    }

    #[test]
    fn test_reconstruct_roundtrip() {
        let mut idx = trained_index();
        let v = vec![1.5, 2.5, 3.5, 4.5];
        idx.add(9, &v);
        assert_eq!(idx.reconstruct(9), Some(v));
    }
}
