// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Penumbra Per-Step Token Types
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use crate::error::{PenumbraError, PenumbraResult};

/// Tolerance on `Σ candidates + residual == 1`.
pub const MASS_TOLERANCE: f64 = 1e-6;

/// One candidate continuation at a generation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCandidate {
    pub text: String,
    /// Probability in (0, 1].
    pub probability: f64,
    /// 0-based rank by descending probability.
    pub rank: usize,
    /// Position in the host's score vector; breaks probability ties.
    pub original_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Truncated distribution of one step: the kept candidates plus the
/// aggregated mass of everything excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKDistribution {
    pub step_index: usize,
    pub candidates: Vec<TokenCandidate>,
    pub residual_mass: f64,
}

impl TopKDistribution {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Highest-probability candidate.
    pub fn top(&self) -> Option<&TokenCandidate> {
        self.candidates.first()
    }

    /// Σ candidate probabilities + residual.
    pub fn total_mass(&self) -> f64 {
        self.candidates.iter().map(|c| c.probability).sum::<f64>() + self.residual_mass
    }

    /// Check the structural invariants: non-empty, probabilities in
    /// (0, 1], descending order with contiguous ranks, total mass 1.
    pub fn validate(&self) -> PenumbraResult<()> {
        if self.candidates.is_empty() {
            return Err(PenumbraError::InvalidDistribution(format!(
                "step {}: distribution has no candidates",
                self.step_index
            )));
        }
        if !self.residual_mass.is_finite() || self.residual_mass < 0.0 {
            return Err(PenumbraError::InvalidDistribution(format!(
                "step {}: residual mass {} out of range",
                self.step_index, self.residual_mass
            )));
        }
        for (i, c) in self.candidates.iter().enumerate() {
            if !(c.probability > 0.0 && c.probability <= 1.0) {
                return Err(PenumbraError::InvalidDistribution(format!(
                    "step {}: candidate {:?} has probability {}",
                    self.step_index, c.text, c.probability
                )));
            }
            if c.rank != i {
                return Err(PenumbraError::InvalidDistribution(format!(
                    "step {}: candidate at position {i} has rank {}",
                    self.step_index, c.rank
                )));
            }
            if i > 0 {
                let prev = &self.candidates[i - 1];
                let ordered = prev.probability > c.probability
                    || (prev.probability == c.probability
                        && prev.original_index < c.original_index);
                if !ordered {
                    return Err(PenumbraError::InvalidDistribution(format!(
                        "step {}: candidates not in descending order at rank {i}",
                        self.step_index
                    )));
                }
            }
        }
        let total = self.total_mass();
        if (total - 1.0).abs() > MASS_TOLERANCE {
            return Err(PenumbraError::InvalidDistribution(format!(
                "step {}: total mass {total:.9} != 1",
                self.step_index
            )));
        }
        Ok(())
    }
}

/// Meaning-equivalent group of candidates from one distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCluster {
    pub id: usize,
    /// Text of the first (highest-probability) member.
    pub representative: String,
    /// Member candidate ranks, non-empty, ascending.
    pub members: Vec<usize>,
    /// Σ member probabilities.
    pub mass: f64,
    /// Unweighted mean of member embeddings; empty under fallback.
    pub centroid: Vec<f32>,
}

/// Clusters of one distribution plus the fixed residual bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPartition {
    pub clusters: Vec<SemanticCluster>,
    /// The "other" bucket; never merged with candidate clusters.
    pub residual_mass: f64,
    /// True when the embedder was unavailable and every candidate
    /// became its own cluster.
    #[serde(default)]
    pub fallback: bool,
}

impl ClusterPartition {
    /// One cluster per candidate, no embeddings.
    pub fn singletons(distribution: &TopKDistribution, fallback: bool) -> Self {
        let clusters = distribution
            .candidates
            .iter()
            .enumerate()
            .map(|(id, c)| SemanticCluster {
                id,
                representative: c.text.clone(),
                members: vec![c.rank],
                mass: c.probability,
                centroid: Vec::new(),
            })
            .collect();
        Self {
            clusters,
            residual_mass: distribution.residual_mass,
            fallback,
        }
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn all_singletons(&self) -> bool {
        self.clusters.iter().all(|c| c.members.len() == 1)
    }

    /// Every candidate rank of `distribution` appears in exactly one
    /// cluster and no cluster is empty.
    pub fn is_partition_of(&self, distribution: &TopKDistribution) -> bool {
        let mut seen = vec![false; distribution.len()];
        for cluster in &self.clusters {
            if cluster.members.is_empty() {
                return false;
            }
            for &rank in &cluster.members {
                match seen.get_mut(rank) {
                    Some(slot) if !*slot => *slot = true,
                    _ => return false,
                }
            }
        }
        seen.into_iter().all(|s| s)
    }
}

/// Everything measured at one generation step. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub step_index: usize,
    pub raw_entropy: f64,
    pub semantic_entropy: f64,
    /// Token actually emitted at this step.
    pub chosen_token: String,
    pub distribution: TopKDistribution,
    pub partition: ClusterPartition,
}

impl TokenMetrics {
    /// Semantic entropy sits more than `delta` below raw entropy: the
    /// competing candidates are mostly paraphrases of each other.
    pub fn is_paraphrase_collapse(&self, delta: f64) -> bool {
        self.semantic_entropy < self.raw_entropy - delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(text: &str, p: f64, rank: usize) -> TokenCandidate {
        TokenCandidate {
            text: text.into(),
            probability: p,
            rank,
            original_index: rank,
            token_id: None,
            logit: None,
            embedding: None,
        }
    }

    fn abc() -> TopKDistribution {
        TopKDistribution {
            step_index: 0,
            candidates: vec![cand("A", 0.7, 0), cand("B", 0.2, 1), cand("C", 0.1, 2)],
            residual_mass: 0.0,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(abc().validate().is_ok());
    }

    #[test]
    fn test_validate_mass_mismatch() {
        let mut d = abc();
        d.residual_mass = 0.2;
        assert!(matches!(d.validate(), Err(PenumbraError::InvalidDistribution(_))));
    }

    #[test]
    fn test_validate_order() {
        let mut d = abc();
        d.candidates.swap(0, 1);
        d.candidates[0].rank = 0;
        d.candidates[1].rank = 1;
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_singletons_partition() {
        let d = abc();
        let p = ClusterPartition::singletons(&d, true);
        assert_eq!(p.len(), 3);
        assert!(p.all_singletons());
        assert!(p.is_partition_of(&d));
        assert!(p.fallback);
    }

    #[test]
    fn test_partition_detects_overlap_and_omission() {
        let d = abc();
        let mut p = ClusterPartition::singletons(&d, false);
        p.clusters[1].members.push(0);
        assert!(!p.is_partition_of(&d));

        let mut p = ClusterPartition::singletons(&d, false);
        p.clusters.pop();
        assert!(!p.is_partition_of(&d));
    }

    #[test]
    fn test_paraphrase_collapse_flag() {
        let d = abc();
        let m = TokenMetrics {
            step_index: 0,
            raw_entropy: 0.8018,
            semantic_entropy: 0.3251,
            chosen_token: "A".into(),
            partition: ClusterPartition::singletons(&d, false),
            distribution: d,
        };
        assert!(m.is_paraphrase_collapse(0.1));
        assert!(!m.is_paraphrase_collapse(0.5));
    }
}
