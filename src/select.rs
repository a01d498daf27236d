//! Adaptive index selection.
//!
//! Picks an ANN backend family from corpus size, dimension, and the
//! advisory memory budget, and emits upgrade advice when observed search
//! latency falls behind the target while a higher-scale backend would fit.
//! Consulted only at store open and by the maintenance surface; a changed
//! decision never auto-migrates.

use crate::ann::{IndexKind, IndexParams};
use serde::Serialize;

/// Corpus-size thresholds for the decision rule.
const THRESHOLD_FLAT: usize = 10_000;
const THRESHOLD_IVF: usize = 100_000;
const THRESHOLD_HNSW: usize = 1_000_000;

/// Inputs to a selection decision.
#[derive(Debug, Clone, Copy)]
pub struct SelectorInputs {
    pub vector_count: usize,
    pub dimension: usize,
    pub memory_budget_bytes: usize,
    pub target_latency_ms: u64,
}

/// A selection decision with its parameters and rationale.
#[derive(Debug, Clone, Serialize)]
pub struct IndexChoice {
    pub kind: IndexKind,
    pub params: IndexParams,
    pub reason: String,
    pub estimated_memory_bytes: usize,
    pub estimated_latency_ms: f64,
}

/// Advisory produced after slow searches; surfaced through the
/// maintenance API, never acted on automatically.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeAdvice {
    pub current: IndexKind,
    pub recommended: IndexKind,
    pub reason: String,
}

/// Pick a backend for a corpus. `override_kind` short-circuits the rule.
pub fn select_index(inputs: SelectorInputs, override_kind: Option<IndexKind>) -> IndexChoice {
    if let Some(kind) = override_kind {
        let params = params_for(kind, inputs);
        return IndexChoice {
            reason: format!("explicit override to {kind}"),
            estimated_memory_bytes: estimate_memory(kind, inputs, &params),
            estimated_latency_ms: estimate_latency(kind, inputs.vector_count),
            kind,
            params,
        };
    }

    let n = inputs.vector_count;
    let kind = if n < THRESHOLD_FLAT {
        IndexKind::Flat
    } else if n < THRESHOLD_IVF {
        IndexKind::Ivf
    } else if n < THRESHOLD_HNSW {
        let raw_bytes = n * inputs.dimension * 4;
        if raw_bytes * 2 > inputs.memory_budget_bytes {
            IndexKind::IvfPq
        } else {
            IndexKind::Ivf
        }
    } else {
        IndexKind::Hnsw
    };

    let params = params_for(kind, inputs);
    let reason = match kind {
        IndexKind::Flat => format!("{n} vectors < {THRESHOLD_FLAT}, exact search is affordable"),
        IndexKind::Ivf => format!(
            "{n} vectors, nlist={} balances build and probe cost",
            params.nlist
        ),
        IndexKind::IvfPq => format!(
            "{n} vectors at dimension {} exceed half the {}MB budget, compressing with m={}",
            inputs.dimension,
            inputs.memory_budget_bytes / (1024 * 1024),
            params.m
        ),
        IndexKind::Hnsw => format!("{n} vectors >= {THRESHOLD_HNSW}, graph search scales best"),
    };
    IndexChoice {
        estimated_memory_bytes: estimate_memory(kind, inputs, &params),
        estimated_latency_ms: estimate_latency(kind, n),
        kind,
        params,
        reason,
    }
}

/// Emit upgrade advice when the rolling search latency exceeds the target
/// and the rule-of-thumb suggests a higher-scale backend.
pub fn upgrade_advice(
    current: IndexKind,
    rolling_avg_latency_ms: f64,
    inputs: SelectorInputs,
) -> Option<UpgradeAdvice> {
    if rolling_avg_latency_ms <= inputs.target_latency_ms as f64 {
        return None;
    }
    let suggested = select_index(inputs, None);
    if suggested.kind.scale_rank() <= current.scale_rank() {
        return None;
    }
    Some(UpgradeAdvice {
        current,
        recommended: suggested.kind,
        reason: format!(
            "rolling search latency {rolling_avg_latency_ms:.1}ms exceeds target {}ms; {} suits {} vectors better than {current}",
            inputs.target_latency_ms, suggested.kind, inputs.vector_count
        ),
    })
}

/// Derive parameters for a backend at this corpus size.
pub fn params_for(kind: IndexKind, inputs: SelectorInputs) -> IndexParams {
    let mut params = IndexParams::default();
    match kind {
        IndexKind::Flat => {}
        IndexKind::Ivf | IndexKind::IvfPq => {
            let nlist = (inputs.vector_count as f64).sqrt() as usize;
            params.nlist = nlist.clamp(16, 256);
            params.nprobe = (params.nlist / 10).max(1);
            if kind == IndexKind::IvfPq {
                params.m = subquantizer_count(inputs.dimension);
                params.nbits = 8;
            }
        }
        IndexKind::Hnsw => {
            params.hnsw_m = 32;
            params.ef_construction = 200;
            params.ef_search = 64;
        }
    }
    params
}

/// Largest power-of-two divisor of `dimension`, clipped to 64.
fn subquantizer_count(dimension: usize) -> usize {
    let mut m = 1;
    while m * 2 <= 64 && dimension % (m * 2) == 0 {
        m *= 2;
    }
    m
}

/// Rough resident-memory estimate per backend family.
fn estimate_memory(kind: IndexKind, inputs: SelectorInputs, params: &IndexParams) -> usize {
    let n = inputs.vector_count;
    let dim = inputs.dimension;
    match kind {
        IndexKind::Flat => n * dim * 4,
        IndexKind::Ivf => n * dim * 4 + params.nlist * dim * 4,
        // m code bytes per vector, plus coarse centroids and the codebook
        IndexKind::IvfPq => n * params.m + params.nlist * dim * 4 + 256 * dim * 4,
        IndexKind::Hnsw => (n * dim * 4) + n * params.hnsw_m * 4 * 2,
    }
}

/// Rough latency estimate in ms per backend family.
fn estimate_latency(kind: IndexKind, vector_count: usize) -> f64 {
    let n = vector_count.max(1) as f64;
    match kind {
        IndexKind::Flat => n * 0.0001,
        IndexKind::Ivf => n.sqrt() * 0.01,
        IndexKind::IvfPq => n.sqrt() * 0.008,
        IndexKind::Hnsw => n.ln().max(1.0) * 2.0 + 5.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(vector_count: usize) -> SelectorInputs {
        SelectorInputs {
            vector_count,
            dimension: 1536,
            memory_budget_bytes: 4096 * 1024 * 1024,
            target_latency_ms: 100,
        }
    }

    #[test]
    fn test_small_corpus_flat() {
        let choice = select_index(inputs(500), None);
        assert_eq!(choice.kind, IndexKind::Flat);
    }

    #[test]
    fn test_mid_corpus_ivf_params() {
        let choice = select_index(inputs(40_000), None);
        assert_eq!(choice.kind, IndexKind::Ivf);
        assert_eq!(choice.params.nlist, 200); // sqrt(40000)
        assert_eq!(choice.params.nprobe, 20);
    }

    #[test]
    fn test_nlist_clamped() {
        let choice = select_index(inputs(10_000), None);
        assert_eq!(choice.params.nlist, 100);
        let choice = select_index(inputs(99_999), None);
        assert_eq!(choice.params.nlist, 256); // sqrt capped at 256
    }

    #[test]
    fn test_large_corpus_memory_pressure_picks_pq() {
        let mut i = inputs(500_000);
        // 500k × 1536 × 4 ≈ 3 GB raw; budget 1 GB → more than half → PQ
        i.memory_budget_bytes = 1024 * 1024 * 1024;
        let choice = select_index(i, None);
        assert_eq!(choice.kind, IndexKind::IvfPq);
        assert_eq!(choice.params.m, 64);
        assert_eq!(choice.params.nbits, 8);

        // Roomy budget keeps raw IVF
        let mut i = inputs(500_000);
        i.memory_budget_bytes = 8 * 1024 * 1024 * 1024;
        let choice = select_index(i, None);
        assert_eq!(choice.kind, IndexKind::Ivf);
    }

    #[test]
    fn test_huge_corpus_hnsw() {
        let choice = select_index(inputs(2_000_000), None);
        assert_eq!(choice.kind, IndexKind::Hnsw);
        assert_eq!(choice.params.hnsw_m, 32);
        assert_eq!(choice.params.ef_construction, 200);
        assert_eq!(choice.params.ef_search, 64);
    }

    #[test]
    fn test_override_respected() {
        let choice = select_index(inputs(5), Some(IndexKind::Hnsw));
        assert_eq!(choice.kind, IndexKind::Hnsw);
        assert!(choice.reason.contains("override"));
    }

    #[test]
    fn test_subquantizer_count_power_of_two_divisor() {
        assert_eq!(subquantizer_count(1536), 64); // 1536 = 512*3, 512 > 64 → 64
        assert_eq!(subquantizer_count(768), 64);
        assert_eq!(subquantizer_count(96), 32);
        assert_eq!(subquantizer_count(6), 2);
        assert_eq!(subquantizer_count(7), 1);
    }

    #[test]
    fn test_upgrade_advice_only_when_slow_and_underscaled() {
        // Fast enough: no advice
        assert!(upgrade_advice(IndexKind::Flat, 50.0, inputs(50_000)).is_none());
        // Slow but already at the suggested scale: no advice
        assert!(upgrade_advice(IndexKind::Ivf, 500.0, inputs(50_000)).is_none());
        // Slow and under-scaled: advice
        let advice = upgrade_advice(IndexKind::Flat, 500.0, inputs(50_000)).unwrap();
        assert_eq!(advice.recommended, IndexKind::Ivf);
        assert_eq!(advice.current, IndexKind::Flat);
    }

    #[test]
    fn test_estimates_present() {
        let choice = select_index(inputs(50_000), None);
        assert!(choice.estimated_memory_bytes > 0);
        assert!(choice.estimated_latency_ms > 0.0);
        assert!(!choice.reason.is_empty());
    }
}
