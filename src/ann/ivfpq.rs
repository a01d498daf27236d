//! IVF-PQ index: inverted lists with product-quantized residuals.
//!
//! Like [`IvfIndex`](crate::ann::ivf::IvfIndex) but each stored vector is
//! encoded as M bytes of PQ codes over its residual against the coarse
//! centroid. Queries build one ADC table per probed list (residual of the
//! query against that list's centroid) and scan codes. Reconstruction is
//! lossy: centroid + decoded residual.

use crate::ann::distance::l2_sq;
use crate::ann::kmeans::{kmeans, nearest_centroid};
use crate::ann::pq::PqCodebook;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};

/// One inverted list: labels plus a contiguous code arena (M bytes each).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodedList {
    pub labels: Vec<u32>,
    pub codes: Vec<u8>,
}

/// IVF index with product-quantized residual storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfPqIndex {
    pub dimension: usize,
    pub nlist: usize,
    pub nprobe: usize,
    /// PQ subquantizer count (bytes per stored vector).
    pub m: usize,
    /// Bits per code; fixed at 8 (256 centroids per subspace).
    pub nbits: usize,
    pub centroids: Vec<f32>,
    pub codebook: Option<PqCodebook>,
    pub lists: Vec<CodedList>,
    pub locations: HashMap<u32, (u32, u32)>,
}

impl IvfPqIndex {
    pub fn new(dimension: usize, nlist: usize, nprobe: usize, m: usize) -> Self {
        Self {
            dimension,
            nlist,
            nprobe: nprobe.clamp(1, nlist),
            m,
            nbits: 8,
            centroids: Vec::new(),
            codebook: None,
            lists: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty() && self.codebook.is_some()
    }

    pub fn size(&self) -> usize {
        self.locations.len()
    }

    /// Train the coarse quantizer and the residual PQ codebook.
    pub fn train(&mut self, samples: &[f32]) {
        let dim = self.dimension;
        self.centroids = kmeans(samples, dim, self.nlist, 0x2e2e);

        // Residuals of the training sample against their coarse centroids
        let n = samples.len() / dim;
        let mut residuals = vec![0.0f32; n * dim];
        for i in 0..n {
            let v = &samples[i * dim..(i + 1) * dim];
            let ci = nearest_centroid(v, &self.centroids, dim);
            let centroid = &self.centroids[ci * dim..(ci + 1) * dim];
            for d in 0..dim {
                residuals[i * dim + d] = v[d] - centroid[d];
            }
        }
        self.codebook = Some(PqCodebook::train(&residuals, dim, self.m, 0x3d3d));
        self.lists = (0..self.nlist).map(|_| CodedList::default()).collect();
    }

    /// Add one vector under `label`. The index must be trained.
    pub fn add(&mut self, label: u32, vector: &[f32]) {
        debug_assert!(self.is_trained());
        let dim = self.dimension;
        let codebook = self.codebook.as_ref().expect("trained");
        let list_idx = nearest_centroid(vector, &self.centroids, dim);
        let centroid = &self.centroids[list_idx * dim..(list_idx + 1) * dim];
        let residual: Vec<f32> = vector
            .iter()
            .zip(centroid.iter())
            .map(|(v, c)| v - c)
            .collect();
        let codes = codebook.encode(&residual);

        let list = &mut self.lists[list_idx];
        let pos = list.labels.len() as u32;
        list.labels.push(label);
        list.codes.extend_from_slice(&codes);
        self.locations.insert(label, (list_idx as u32, pos));
    }

    /// Physically remove the given labels. Returns the number removed.
    pub fn remove(&mut self, labels: &[u32]) -> usize {
        let mut removed = 0;
        for &label in labels {
            let Some((list_idx, pos)) = self.locations.remove(&label) else {
                continue;
            };
            let m = self.m;
            let list = &mut self.lists[list_idx as usize];
            let last = list.labels.len() - 1;
            let pos = pos as usize;
            list.labels.swap_remove(pos);
            if pos != last {
                let (dst, src) = (pos * m, last * m);
                for b in 0..m {
                    list.codes[dst + b] = list.codes[src + b];
                }
                let moved = list.labels[pos];
                self.locations.insert(moved, (list_idx, pos as u32));
            }
            list.codes.truncate(last * m);
            removed += 1;
        }
        removed
    }

    /// Top-k ADC search over the `nprobe` nearest lists.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(u32, f32)> {
        if k == 0 || !self.is_trained() || self.locations.is_empty() {
            return Vec::new();
        }
        let dim = self.dimension;
        let codebook = self.codebook.as_ref().expect("trained");

        let mut ranked: Vec<(f32, usize)> = (0..self.nlist)
            .map(|ci| {
                let centroid = &self.centroids[ci * dim..(ci + 1) * dim];
                (l2_sq(query, centroid), ci)
            })
            .collect();
        ranked.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut heap: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(k + 1);
        let mut residual = vec![0.0f32; dim];
        for &(_, list_idx) in ranked.iter().take(self.nprobe) {
            let list = &self.lists[list_idx];
            if list.labels.is_empty() {
                continue;
            }
            let centroid = &self.centroids[list_idx * dim..(list_idx + 1) * dim];
            for d in 0..dim {
                residual[d] = query[d] - centroid[d];
            }
            let table = codebook.build_distance_table(&residual);
            for (i, &label) in list.labels.iter().enumerate() {
                let codes = &list.codes[i * self.m..(i + 1) * self.m];
                let dist = table.distance(codes);
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

    /// Lossy reconstruction: coarse centroid + decoded residual.
    pub fn reconstruct(&self, label: u32) -> Option<Vec<f32>> {
        let &(list_idx, pos) = self.locations.get(&label)?;
        let codebook = self.codebook.as_ref()?;
        let dim = self.dimension;
        let list = &self.lists[list_idx as usize];
        let codes = &list.codes[pos as usize * self.m..(pos as usize + 1) * self.m];
        let residual = codebook.decode(codes);
        let centroid = &self.centroids[list_idx as usize * dim..(list_idx as usize + 1) * dim];
        Some(
            centroid
                .iter()
                .zip(residual.iter())
                .map(|(c, r)| c + r)
                .collect(),
        )
    }

    /// Estimated resident memory in bytes. Codes dominate: M bytes per vector.
    pub fn memory_bytes(&self) -> usize {
        let codes: usize = self.lists.iter().map(|l| l.codes.len()).sum();
        let labels: usize = self.lists.iter().map(|l| l.labels.len() * 4).sum();
        let codebook = self
            .codebook
            .as_ref()
            .map(|cb| cb.centroids.len() * 4)
            .unwrap_or(0);
        codes + labels + codebook + self.centroids.len() * 4 + self.locations.len() * 16
    }

    /// All stored labels.
    pub fn labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.locations.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize, dim: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(n * dim);
        for i in 0..n {
            for d in 0..dim {
                data.push(((i * 31 + d * 17) % 89) as f32 / 89.0);
            }
        }
        data
    }

    fn trained_index(dim: usize) -> IvfPqIndex {
        let mut idx = IvfPqIndex::new(dim, 4, 4, 2);
        idx.train(&sample(300, dim));
        idx
    }

    #[test]
    fn test_trained_after_train() {
        let idx = trained_index(8);
        assert!(idx.is_trained());
        assert_eq!(idx.size(), 0);
    }

    #[test]
    fn test_add_search_finds_nearest() {
        let dim = 8;
        let mut idx = trained_index(dim);
        let data = sample(50, dim);
        for i in 0..50u32 {
            idx.add(i, &data[i as usize * dim..(i as usize + 1) * dim]);
        }

        // Query with an indexed vector: it should be among the top few
        // despite quantization loss
        let target = 7u32;
        let query = &data[target as usize * dim..(target as usize + 1) * dim];
        let results = idx.search(query, 5);
        assert!(!results.is_empty());
        assert!(
            results.iter().any(|&(label, _)| label == target),
            "expected label {target} in {results:?}"
        );
    }

    #[test]
    fn test_reconstruct_is_close() {
        let dim = 8;
        let mut idx = trained_index(dim);
        let data = sample(20, dim);
        idx.add(3, &data[3 * dim..4 * dim]);
        let rec = idx.reconstruct(3).unwrap();
        let err = crate::ann::distance::l2_sq(&data[3 * dim..4 * dim], &rec);
        assert!(err < 1.0, "reconstruction error too large: {err}");
    }

    #[test]
    fn test_remove() {
        let dim = 8;
        let mut idx = trained_index(dim);
        let data = sample(10, dim);
        for i in 0..10u32 {
            idx.add(i, &data[i as usize * dim..(i as usize + 1) * dim]);
        }
        assert_eq!(idx.remove(&[3, 7, 99]), 2);
        assert_eq!(idx.size(), 8);
        assert!(idx.reconstruct(3).is_none());
        assert!(idx.reconstruct(4).is_some());
    }

    #[test]
    fn test_memory_smaller_than_raw() {
        let dim = 32;
        let mut idx = IvfPqIndex::new(dim, 2, 2, 4);
        idx.train(&sample(300, dim));
        let data = sample(100, dim);
        for i in 0..100u32 {
            idx.add(i, &data[i as usize * dim..(i as usize + 1) * dim]);
        }
        let raw_bytes = 100 * dim * 4;
        // Stored codes are 4 bytes per vector vs 128 raw
        let code_bytes: usize = idx.lists.iter().map(|l| l.codes.len()).sum();
        assert!(code_bytes * 8 < raw_bytes);
    }
}
