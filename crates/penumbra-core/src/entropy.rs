// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Dual Entropy Engine
// ─────────────────────────────────────────────────────────────────────
//! Raw and semantic Shannon entropy, in nats.
//!
//! Both measures treat the residual mass as one extra bucket, so the
//! raw entropy of a top-k distribution lies in `[0, ln(k + 1)]`.
//! Semantic entropy runs the same formula over cluster masses and can
//! only be lower than or equal to raw entropy.

use penumbra_types::{ClusterPartition, TopKDistribution};

/// `-Σ p ln p` over the given bucket masses, with `0 ln 0 := 0`.
pub fn entropy_of(masses: impl IntoIterator<Item = f64>) -> f64 {
    let h: f64 = masses
        .into_iter()
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    h.max(0.0)
}

/// Entropy over individual candidates plus the residual bucket.
pub fn raw_entropy(distribution: &TopKDistribution) -> f64 {
    entropy_of(
        distribution
            .candidates
            .iter()
            .map(|c| c.probability)
            .chain(std::iter::once(distribution.residual_mass)),
    )
}

/// Entropy over cluster masses plus the residual bucket.
pub fn semantic_entropy(partition: &ClusterPartition) -> f64 {
    entropy_of(
        partition
            .clusters
            .iter()
            .map(|c| c.mass)
            .chain(std::iter::once(partition.residual_mass)),
    )
}

/// Upper bound of raw entropy for a given `top_k`.
#[inline]
pub fn max_entropy(top_k: usize) -> f64 {
    ((top_k + 1) as f64).ln()
}

/// Entropy scaled into [0, 1] by `ln(top_k + 1)`.
#[inline]
pub fn normalized(entropy: f64, top_k: usize) -> f64 {
    let max = max_entropy(top_k);
    if max <= 0.0 {
        return 0.0;
    }
    (entropy / max).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use penumbra_types::{SemanticCluster, TokenCandidate};

    fn dist(probs: &[f64], residual: f64) -> TopKDistribution {
        TopKDistribution {
            step_index: 0,
            candidates: probs
                .iter()
                .enumerate()
                .map(|(i, &p)| TokenCandidate {
                    text: format!("t{i}"),
                    probability: p,
                    rank: i,
                    original_index: i,
                    token_id: None,
                    logit: None,
                    embedding: None,
                })
                .collect(),
            residual_mass: residual,
        }
    }

    fn cluster(id: usize, members: Vec<usize>, mass: f64) -> SemanticCluster {
        SemanticCluster {
            id,
            representative: format!("t{}", members[0]),
            members,
            mass,
            centroid: Vec::new(),
        }
    }

    #[test]
    fn test_raw_entropy_abc() {
        let d = dist(&[0.7, 0.2, 0.1], 0.0);
        let expected = -(0.7f64 * 0.7f64.ln() + 0.2 * 0.2f64.ln() + 0.1 * 0.1f64.ln());
        assert!((raw_entropy(&d) - expected).abs() < 1e-12);
        assert!((raw_entropy(&d) - 0.8018).abs() < 1e-4);
    }

    #[test]
    fn test_semantic_entropy_abc_merge() {
        let d = dist(&[0.7, 0.2, 0.1], 0.0);
        let p = ClusterPartition {
            clusters: vec![cluster(0, vec![0, 1], 0.9), cluster(1, vec![2], 0.1)],
            residual_mass: 0.0,
            fallback: false,
        };
        let h = semantic_entropy(&p);
        assert!((h - 0.3251).abs() < 1e-4);
        assert!(h < raw_entropy(&d));
    }

    #[test]
    fn test_singletons_equal_raw() {
        let d = dist(&[0.5, 0.3, 0.1], 0.1);
        let p = ClusterPartition::singletons(&d, false);
        assert!((semantic_entropy(&p) - raw_entropy(&d)).abs() < 1e-12);
    }

    #[test]
    fn test_zero_when_one_bucket() {
        let d = dist(&[1.0], 0.0);
        assert_eq!(raw_entropy(&d), 0.0);
    }

    #[test]
    fn test_residual_counts_as_bucket() {
        let d = dist(&[0.5], 0.5);
        assert!((raw_entropy(&d) - 2.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_hits_upper_bound() {
        let k = 4;
        let d = dist(&[0.2; 4], 0.2);
        assert!((raw_entropy(&d) - max_entropy(k)).abs() < 1e-12);
        assert!((normalized(raw_entropy(&d), k) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bounds_over_many_shapes() {
        for k in 1..8usize {
            for skew in [1.0_f64, 1.5, 3.0, 10.0] {
                let weights: Vec<f64> = (0..k).map(|i| skew.powi(-(i as i32))).collect();
                let total: f64 = weights.iter().sum::<f64>() * 1.25;
                let probs: Vec<f64> = weights.iter().map(|w| w / total).collect();
                let residual = 1.0 - probs.iter().sum::<f64>();
                let h = raw_entropy(&dist(&probs, residual));
                assert!(h >= 0.0 && h <= max_entropy(k) + 1e-12, "k={k} h={h}");
            }
        }
    }

    #[test]
    fn test_merging_never_increases_entropy() {
        let d = dist(&[0.4, 0.3, 0.2, 0.1], 0.0);
        let merged = ClusterPartition {
            clusters: vec![cluster(0, vec![0, 3], 0.5), cluster(1, vec![1, 2], 0.5)],
            residual_mass: 0.0,
            fallback: false,
        };
        assert!(semantic_entropy(&merged) < raw_entropy(&d));
    }
}
