//! Weighted Reciprocal Rank Fusion.
//!
//! Each input list contributes `weight / (C + rank)` per document (ranks
//! 1-based, `C` = 60); scores sum across lists. Ties break on the smaller
//! raw L2 distance seen in any vector list, then on lexicographic doc_id,
//! which makes the ranking fully deterministic.

use crate::config::RRF_C;
use std::collections::HashMap;
use uuid::Uuid;

/// One ranked input list.
pub struct RankedList<'a> {
    /// `(doc_id, raw)` in rank order. `raw` is an L2 distance for vector
    /// lists and a BM25 score for keyword lists.
    pub entries: &'a [(Uuid, f32)],
    /// Non-negative list weight.
    pub weight: f32,
    /// Whether `raw` is a distance (participates in the tiebreak).
    pub carries_distance: bool,
}

/// A fused candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub doc_id: Uuid,
    /// Summed RRF score.
    pub score: f32,
    /// Best (smallest) raw distance across the vector lists, when any.
    pub distance: Option<f32>,
}

/// Fuse ranked lists into a single descending-score ranking.
pub fn rrf_fuse(lists: &[RankedList<'_>]) -> Vec<FusedHit> {
    let mut acc: HashMap<Uuid, (f32, Option<f32>)> = HashMap::new();
    for list in lists {
        for (rank0, (doc_id, raw)) in list.entries.iter().enumerate() {
            let contribution = list.weight / (RRF_C + rank0 as f32 + 1.0);
            let entry = acc.entry(*doc_id).or_insert((0.0, None));
            entry.0 += contribution;
            if list.carries_distance {
                entry.1 = Some(match entry.1 {
                    Some(best) if best <= *raw => best,
                    _ => *raw,
                });
            }
        }
    }

    let mut fused: Vec<FusedHit> = acc
        .into_iter()
        .map(|(doc_id, (score, distance))| FusedHit {
            doc_id,
            score,
            distance,
        })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| match (a.distance, b.distance) {
                (Some(da), Some(db)) => {
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.doc_id.cmp(&b.doc_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut v: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_multi_list_support_wins() {
        // Hot=[A,B,C] w=0.7, Cold=[D,B,E] w=0.3, BM25=[B,F,A] w=0.3.
        // B is supported by all three lists and must rank first; A by two
        // lists and must rank second. D must beat E and F.
        let v = ids(6);
        let (a, b, c, d, e, f) = (v[0], v[1], v[2], v[3], v[4], v[5]);
        let hot = vec![(a, 0.1), (b, 0.2), (c, 0.3)];
        let cold = vec![(d, 0.15), (b, 0.25), (e, 0.35)];
        let bm25 = vec![(b, 9.0), (f, 5.0), (a, 2.0)];

        let fused = rrf_fuse(&[
            RankedList {
                entries: &hot,
                weight: 0.7,
                carries_distance: true,
            },
            RankedList {
                entries: &cold,
                weight: 0.3,
                carries_distance: true,
            },
            RankedList {
                entries: &bm25,
                weight: 0.3,
                carries_distance: false,
            },
        ]);

        assert_eq!(fused[0].doc_id, b);
        assert_eq!(fused[1].doc_id, a);
        let pos = |id: Uuid| fused.iter().position(|h| h.doc_id == id).unwrap();
        assert!(pos(d) < pos(e));
        assert!(pos(d) < pos(f));
    }

    #[test]
    fn test_rank_positions_decide_within_one_list() {
        let v = ids(3);
        let list = vec![(v[0], 0.1), (v[1], 0.2), (v[2], 0.3)];
        let fused = rrf_fuse(&[RankedList {
            entries: &list,
            weight: 1.0,
            carries_distance: true,
        }]);
        assert_eq!(fused[0].doc_id, v[0]);
        assert_eq!(fused[2].doc_id, v[2]);
        assert!(fused[0].score > fused[1].score);
    }

    #[test]
    fn test_tie_broken_by_distance_then_id() {
        let v = ids(2);
        // Same rank in two equal-weight lists → equal scores
        let l1 = vec![(v[0], 0.5)];
        let l2 = vec![(v[1], 0.2)];
        let fused = rrf_fuse(&[
            RankedList {
                entries: &l1,
                weight: 0.5,
                carries_distance: true,
            },
            RankedList {
                entries: &l2,
                weight: 0.5,
                carries_distance: true,
            },
        ]);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].score - fused[1].score).abs() < 1e-9);
        // Smaller distance wins the tie
        assert_eq!(fused[0].doc_id, v[1]);

        // Equal distances fall back to doc_id order
        let l1 = vec![(v[1], 0.5)];
        let l2 = vec![(v[0], 0.5)];
        let fused = rrf_fuse(&[
            RankedList {
                entries: &l1,
                weight: 0.5,
                carries_distance: true,
            },
            RankedList {
                entries: &l2,
                weight: 0.5,
                carries_distance: true,
            },
        ]);
        assert_eq!(fused[0].doc_id, v[0]);
    }

    #[test]
    fn test_distance_tracked_as_minimum() {
        let v = ids(1);
        let l1 = vec![(v[0], 0.9)];
        let l2 = vec![(v[0], 0.3)];
        let fused = rrf_fuse(&[
            RankedList {
                entries: &l1,
                weight: 0.7,
                carries_distance: true,
            },
            RankedList {
                entries: &l2,
                weight: 0.3,
                carries_distance: true,
            },
        ]);
        assert_eq!(fused[0].distance, Some(0.3));
    }

    #[test]
    fn test_bm25_only_hit_has_no_distance() {
        let v = ids(1);
        let bm25 = vec![(v[0], 7.0)];
        let fused = rrf_fuse(&[RankedList {
            entries: &bm25,
            weight: 0.3,
            carries_distance: false,
        }]);
        assert_eq!(fused[0].distance, None);
    }

    #[test]
    fn test_empty_lists() {
        assert!(rrf_fuse(&[]).is_empty());
        let empty: Vec<(Uuid, f32)> = Vec::new();
        let fused = rrf_fuse(&[RankedList {
            entries: &empty,
            weight: 1.0,
            carries_distance: true,
        }]);
        assert!(fused.is_empty());
    }

    #[test]
    fn test_zero_weight_list_contributes_nothing() {
        let v = ids(2);
        let l1 = vec![(v[0], 0.1)];
        let l2 = vec![(v[1], 0.1)];
        let fused = rrf_fuse(&[
            RankedList {
                entries: &l1,
                weight: 1.0,
                carries_distance: true,
            },
            RankedList {
                entries: &l2,
                weight: 0.0,
                carries_distance: true,
            },
        ]);
        assert_eq!(fused[0].doc_id, v[0]);
        assert_eq!(fused[1].score, 0.0);
    }
}
