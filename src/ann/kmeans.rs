//! K-means clustering used by the IVF coarse quantizer and PQ training.
//!
//! K-means++ initialization followed by a fixed number of Lloyd
//! iterations. Uses a small deterministic xorshift PRNG so training is
//! reproducible within a process without pulling randomness into every
//! backend.

use crate::ann::distance::l2_sq;

/// Lloyd iterations per training run.
pub const KMEANS_ITERATIONS: usize = 10;

/// K-means clustering with k-means++ initialization.
///
/// `data` is a contiguous arena of `n` points, each `dim` floats.
/// Returns `k × dim` centroids as a flat vector. When `n <= k`, each
/// point becomes its own centroid and the remainder are zero-padded.
pub fn kmeans(data: &[f32], dim: usize, k: usize, seed: u64) -> Vec<f32> {
    let n = data.len() / dim;
    if n <= k {
        let mut centroids = vec![0.0f32; k * dim];
        centroids[..n * dim].copy_from_slice(&data[..n * dim]);
        return centroids;
    }

    let mut rng = XorShiftRng::new(seed);
    let mut centroids = vec![0.0f32; k * dim];

    // First centroid: random point
    let first = rng.next_usize() % n;
    centroids[..dim].copy_from_slice(&data[first * dim..(first + 1) * dim]);

    // K-means++: remaining centroids weighted by squared distance
    let mut min_dists = vec![f32::MAX; n];
    for ci in 1..k {
        let last = &centroids[(ci - 1) * dim..ci * dim];
        let mut total = 0.0f64;
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let d = l2_sq(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        if total < 1e-30 {
            // All points coincide with existing centroids
            let idx = rng.next_usize() % n;
            centroids[ci * dim..(ci + 1) * dim]
                .copy_from_slice(&data[idx * dim..(idx + 1) * dim]);
            continue;
        }
        let threshold = rng.next_f64() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = n - 1;
        for (i, &d) in min_dists.iter().enumerate() {
            cumulative += d as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids[ci * dim..(ci + 1) * dim]
            .copy_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }

    // Lloyd iterations
    let mut assignments = vec![0u32; n];
    for _ in 0..KMEANS_ITERATIONS {
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let mut best = 0u32;
            let mut best_dist = f32::MAX;
            for ci in 0..k {
                let centroid = &centroids[ci * dim..(ci + 1) * dim];
                let d = l2_sq(point, centroid);
                if d < best_dist {
                    best_dist = d;
                    best = ci as u32;
                }
            }
            assignments[i] = best;
        }

        let mut counts = vec![0u32; k];
        let mut sums = vec![0.0f32; k * dim];
        for i in 0..n {
            let ci = assignments[i] as usize;
            counts[ci] += 1;
            let point = &data[i * dim..(i + 1) * dim];
            let c = &mut sums[ci * dim..(ci + 1) * dim];
            for d in 0..dim {
                c[d] += point[d];
            }
        }
        for ci in 0..k {
            if counts[ci] > 0 {
                let inv = 1.0 / counts[ci] as f32;
                let src = &sums[ci * dim..(ci + 1) * dim];
                let dst = &mut centroids[ci * dim..(ci + 1) * dim];
                for d in 0..dim {
                    dst[d] = src[d] * inv;
                }
            }
            // Empty clusters keep their previous centroid
        }
    }

    centroids
}

/// Index of the nearest centroid to `point` in a flat centroid arena.
#[inline]
pub fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize) -> usize {
    let k = centroids.len() / dim;
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for ci in 0..k {
        let d = l2_sq(point, &centroids[ci * dim..(ci + 1) * dim]);
        if d < best_dist {
            best_dist = d;
            best = ci;
        }
    }
    best
}

/// Minimal deterministic PRNG (xorshift64).
struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x517cc1b727220a95,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_usize(&mut self) -> usize {
        self.next_u64() as usize
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs(n_per: usize, dim: usize) -> Vec<f32> {
        let mut data = Vec::with_capacity(n_per * 2 * dim);
        for i in 0..n_per {
            for d in 0..dim {
                data.push(0.0 + ((i * 13 + d * 7) % 10) as f32 * 0.01);
            }
        }
        for i in 0..n_per {
            for d in 0..dim {
                data.push(10.0 + ((i * 11 + d * 3) % 10) as f32 * 0.01);
            }
        }
        data
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let dim = 4;
        let data = two_blobs(50, dim);
        let centroids = kmeans(&data, dim, 2, 42);
        // One centroid should land near 0, the other near 10
        let c0 = centroids[0];
        let c1 = centroids[dim];
        let (lo, hi) = if c0 < c1 { (c0, c1) } else { (c1, c0) };
        assert!(lo < 1.0, "low centroid should be near 0, got {lo}");
        assert!(hi > 9.0, "high centroid should be near 10, got {hi}");
    }

    #[test]
    fn test_kmeans_fewer_points_than_clusters() {
        let data = vec![1.0, 2.0, 3.0, 4.0]; // 2 points, dim 2
        let centroids = kmeans(&data, 2, 4, 7);
        assert_eq!(centroids.len(), 4 * 2);
        assert_eq!(&centroids[..4], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(&centroids[4..], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_nearest_centroid() {
        let centroids = vec![0.0, 0.0, 10.0, 10.0];
        assert_eq!(nearest_centroid(&[1.0, 1.0], &centroids, 2), 0);
        assert_eq!(nearest_centroid(&[9.0, 9.5], &centroids, 2), 1);
    }

    #[test]
    fn test_kmeans_deterministic_for_seed() {
        let dim = 4;
        let data = two_blobs(30, dim);
        let a = kmeans(&data, dim, 2, 5);
        let b = kmeans(&data, dim, 2, 5);
        assert_eq!(a, b);
    }
}
