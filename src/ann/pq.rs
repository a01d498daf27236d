//! Product Quantization for the IVF-PQ backend.
//!
//! Splits vectors into M subspaces and learns K=256 centroids per
//! subspace via k-means. Each vector is encoded as M bytes. Query-time
//! distance uses a precomputed lookup table: M table lookups + M
//! additions instead of D multiply-adds.

use crate::ann::kmeans::kmeans;
use serde::{Deserialize, Serialize};

/// Centroids per subspace; fixed at 256 so codes fit in a byte.
pub const PQ_CENTROIDS: usize = 256;

/// PQ codebook: M subspaces × 256 centroids × sub_dim floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqCodebook {
    pub num_subspaces: usize,
    pub sub_dim: usize,
    /// Flat centroid array:
    /// `centroids[m * 256 * sub_dim + k * sub_dim .. + sub_dim]`.
    pub centroids: Vec<f32>,
}

/// Precomputed partial-distance table for one query: `[M][256]`.
pub struct PqDistanceTable {
    table: Vec<f32>,
    num_subspaces: usize,
}

impl PqCodebook {
    /// Train a codebook on a contiguous arena of `dim`-float vectors.
    ///
    /// `m` must divide `dim`. With IVF-PQ the training vectors are the
    /// residuals against the coarse centroids, not the raw vectors.
    pub fn train(vectors: &[f32], dim: usize, m: usize, seed: u64) -> Self {
        assert!(dim % m == 0, "dimension must be divisible by num_subspaces");
        let sub_dim = dim / m;
        let n = vectors.len() / dim;
        assert!(n > 0, "need at least one vector to train PQ");

        let mut centroids = vec![0.0f32; m * PQ_CENTROIDS * sub_dim];
        for sub in 0..m {
            let mut sub_vectors = vec![0.0f32; n * sub_dim];
            for i in 0..n {
                let src = i * dim + sub * sub_dim;
                sub_vectors[i * sub_dim..(i + 1) * sub_dim]
                    .copy_from_slice(&vectors[src..src + sub_dim]);
            }
            let sub_centroids = kmeans(&sub_vectors, sub_dim, PQ_CENTROIDS, seed ^ sub as u64);
            let out = sub * PQ_CENTROIDS * sub_dim;
            centroids[out..out + PQ_CENTROIDS * sub_dim].copy_from_slice(&sub_centroids);
        }

        Self {
            num_subspaces: m,
            sub_dim,
            centroids,
        }
    }

    /// Encode one vector into M codes.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.num_subspaces);
        for sub in 0..self.num_subspaces {
            let sub_vec = &vector[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            codes.push(self.nearest(sub, sub_vec));
        }
        codes
    }

    /// Decode M codes back to an approximate vector.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_subspaces * self.sub_dim);
        for (sub, &code) in codes.iter().enumerate() {
            let start = sub * PQ_CENTROIDS * self.sub_dim + code as usize * self.sub_dim;
            out.extend_from_slice(&self.centroids[start..start + self.sub_dim]);
        }
        out
    }

    /// Build the ADC lookup table for a query (or query residual).
    pub fn build_distance_table(&self, query: &[f32]) -> PqDistanceTable {
        let mut table = vec![0.0f32; self.num_subspaces * PQ_CENTROIDS];
        for sub in 0..self.num_subspaces {
            let q_sub = &query[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            let row = sub * PQ_CENTROIDS;
            for ci in 0..PQ_CENTROIDS {
                let c_start = sub * PQ_CENTROIDS * self.sub_dim + ci * self.sub_dim;
                let centroid = &self.centroids[c_start..c_start + self.sub_dim];
                let mut sum = 0.0f32;
                for d in 0..self.sub_dim {
                    let diff = q_sub[d] - centroid[d];
                    sum += diff * diff;
                }
                table[row + ci] = sum;
            }
        }
        PqDistanceTable {
            table,
            num_subspaces: self.num_subspaces,
        }
    }

    #[inline]
    fn nearest(&self, subspace: usize, sub_vec: &[f32]) -> u8 {
        let base = subspace * PQ_CENTROIDS * self.sub_dim;
        let mut best_idx = 0u8;
        let mut best_dist = f32::MAX;
        for ci in 0..PQ_CENTROIDS {
            let c_start = base + ci * self.sub_dim;
            let centroid = &self.centroids[c_start..c_start + self.sub_dim];
            let mut dist = 0.0f32;
            for d in 0..self.sub_dim {
                let diff = sub_vec[d] - centroid[d];
                dist += diff * diff;
            }
            if dist < best_dist {
                best_dist = dist;
                best_idx = ci as u8;
            }
        }
        best_idx
    }
}

impl PqDistanceTable {
    /// Approximate distance for one PQ-encoded vector (M bytes).
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        let mut dist = 0.0f32;
        for m in 0..self.num_subspaces {
            dist += self.table[m * PQ_CENTROIDS + codes[m] as usize];
        }
        dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::distance::l2_sq;

    fn sample_vectors(n: usize, dim: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(n * dim);
        for i in 0..n {
            for d in 0..dim {
                data.push(((i * 7 + d * 13) % 97) as f32 / 97.0);
            }
        }
        data
    }

    #[test]
    fn test_encode_decode_roundtrip_error_bounded() {
        let dim = 8;
        let data = sample_vectors(400, dim);
        let cb = PqCodebook::train(&data, dim, 2, 42);

        let v = &data[..dim];
        let codes = cb.encode(v);
        assert_eq!(codes.len(), 2);
        let decoded = cb.decode(&codes);
        assert_eq!(decoded.len(), dim);
        // Reconstruction error should be far smaller than the vector norm
        let err = l2_sq(v, &decoded);
        let norm: f32 = v.iter().map(|x| x * x).sum();
        assert!(err < norm, "decode error {err} should be below norm {norm}");
    }

    #[test]
    fn test_distance_table_matches_decoded_distance() {
        let dim = 8;
        let data = sample_vectors(400, dim);
        let cb = PqCodebook::train(&data, dim, 4, 1);

        let query = &data[dim..2 * dim];
        let target = &data[5 * dim..6 * dim];
        let codes = cb.encode(target);

        let table = cb.build_distance_table(query);
        let adc = table.distance(&codes);
        let exact_to_decoded = l2_sq(query, &cb.decode(&codes));
        assert!(
            (adc - exact_to_decoded).abs() < 1e-3,
            "ADC {adc} should equal distance to decoded {exact_to_decoded}"
        );
    }

    #[test]
    fn test_small_training_set() {
        // Fewer vectors than centroids: padding path
        let dim = 4;
        let data = sample_vectors(10, dim);
        let cb = PqCodebook::train(&data, dim, 2, 9);
        let codes = cb.encode(&data[..dim]);
        assert_eq!(codes.len(), 2);
    }

    #[test]
    #[should_panic(expected = "divisible")]
    fn test_indivisible_dimension_panics() {
        let data = sample_vectors(10, 6);
        PqCodebook::train(&data, 6, 4, 0);
    }
}
