// ─────────────────────────────────────────────────────────────────────
// Director-Class AI — Semantic Clusterer
// ─────────────────────────────────────────────────────────────────────
//! Greedy online clustering of top-k candidates into meaning-equivalent
//! groups.
//!
//! Candidates are visited in rank order. Each one joins the existing
//! cluster whose centroid is most similar, provided the similarity
//! reaches the threshold; ties go to the earliest-created cluster.
//! Otherwise it opens a new cluster. Centroids are the unweighted mean
//! of member embeddings. The residual mass stays a separate bucket.

use std::sync::Arc;

use penumbra_types::{ClusterPartition, PenumbraError, SemanticCluster, TopKDistribution};

use crate::embedder::{cosine_similarity, Embedder};

/// Cluster a distribution, embedding candidate texts with `embedder`.
///
/// Candidate embeddings already present on the distribution are used
/// as-is. A missing or failing embedder yields the all-singleton
/// partition with `fallback = true`.
pub fn cluster(
    distribution: &TopKDistribution,
    similarity_threshold: f64,
    embedder: Option<&dyn Embedder>,
) -> ClusterPartition {
    match candidate_embeddings(distribution, embedder) {
        Ok(embeddings) => cluster_with_embeddings(distribution, similarity_threshold, &embeddings),
        Err(e) => {
            log::warn!(
                "step {}: {e}; falling back to singleton clusters",
                distribution.step_index
            );
            ClusterPartition::singletons(distribution, true)
        }
    }
}

/// Pure clustering core over precomputed embeddings (one per candidate,
/// in rank order).
pub fn cluster_with_embeddings(
    distribution: &TopKDistribution,
    similarity_threshold: f64,
    embeddings: &[Vec<f32>],
) -> ClusterPartition {
    if embeddings.len() != distribution.len() {
        log::warn!(
            "step {}: {} embeddings for {} candidates; falling back to singleton clusters",
            distribution.step_index,
            embeddings.len(),
            distribution.len()
        );
        return ClusterPartition::singletons(distribution, true);
    }

    let mut clusters: Vec<SemanticCluster> = Vec::new();
    // Running member sums in f64; centroids are re-derived from them.
    let mut sums: Vec<Vec<f64>> = Vec::new();

    for (candidate, embedding) in distribution.candidates.iter().zip(embeddings) {
        let mut best: Option<(usize, f64)> = None;
        for (ci, c) in clusters.iter().enumerate() {
            let sim = cosine_similarity(embedding, &c.centroid);
            if sim >= similarity_threshold && best.map_or(true, |(_, b)| sim > b) {
                best = Some((ci, sim));
            }
        }

        match best {
            Some((ci, _)) => {
                let c = &mut clusters[ci];
                c.members.push(candidate.rank);
                c.mass += candidate.probability;
                let n = c.members.len() as f64;
                for (s, &x) in sums[ci].iter_mut().zip(embedding) {
                    *s += x as f64;
                }
                c.centroid = sums[ci].iter().map(|s| (s / n) as f32).collect();
            }
            None => {
                sums.push(embedding.iter().map(|&x| x as f64).collect());
                clusters.push(SemanticCluster {
                    id: clusters.len(),
                    representative: candidate.text.clone(),
                    members: vec![candidate.rank],
                    mass: candidate.probability,
                    centroid: embedding.clone(),
                });
            }
        }
    }

    ClusterPartition {
        clusters,
        residual_mass: distribution.residual_mass,
        fallback: false,
    }
}

fn candidate_embeddings(
    distribution: &TopKDistribution,
    embedder: Option<&dyn Embedder>,
) -> Result<Vec<Vec<f32>>, PenumbraError> {
    if let Some(vectors) = distribution
        .candidates
        .iter()
        .map(|c| c.embedding.clone())
        .collect::<Option<Vec<_>>>()
    {
        return check_dimensions(vectors);
    }

    let embedder = embedder.ok_or_else(|| {
        PenumbraError::EmbeddingUnavailable("no embedder configured".to_string())
    })?;
    let texts: Vec<&str> = distribution.candidates.iter().map(|c| c.text.as_str()).collect();
    let vectors = embedder.embed_batch(&texts)?;
    if vectors.len() != texts.len() {
        return Err(PenumbraError::EmbeddingUnavailable(format!(
            "embedder returned {} vectors for {} candidates",
            vectors.len(),
            texts.len()
        )));
    }
    check_dimensions(vectors)
}

fn check_dimensions(vectors: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>, PenumbraError> {
    let dim = vectors.first().map_or(0, Vec::len);
    if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
        return Err(PenumbraError::EmbeddingUnavailable(
            "embeddings are empty or of inconsistent dimension".to_string(),
        ));
    }
    if vectors.iter().flatten().any(|x| !x.is_finite()) {
        return Err(PenumbraError::EmbeddingUnavailable(
            "embedding contains non-finite values".to_string(),
        ));
    }
    Ok(vectors)
}

/// Threshold plus embedder, bundled for repeated per-step use.
#[derive(Clone)]
pub struct SemanticClusterer {
    similarity_threshold: f64,
    embedder: Option<Arc<dyn Embedder>>,
}

impl SemanticClusterer {
    pub fn new(similarity_threshold: f64, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { similarity_threshold, embedder }
    }

    pub fn cluster(&self, distribution: &TopKDistribution) -> ClusterPartition {
        cluster(distribution, self.similarity_threshold, self.embedder.as_deref())
    }

    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{capture, RawScores};
    use crate::embedder::{ExternalEmbedder, NgramEmbedder};
    use crate::entropy::{raw_entropy, semantic_entropy};

    fn abc() -> TopKDistribution {
        capture(0, &RawScores::probabilities([("A", 0.7), ("B", 0.2), ("C", 0.1)]), 3, 0.0).unwrap()
    }

    /// A and B point the same way, C is orthogonal.
    fn ab_close() -> ExternalEmbedder {
        ExternalEmbedder::new(|t| match t {
            "A" => Ok(vec![1.0, 0.0]),
            "B" => Ok(vec![0.95, 0.05]),
            "C" => Ok(vec![0.0, 1.0]),
            other => Err(format!("unknown token {other}")),
        })
    }

    #[test]
    fn test_ab_merge_scenario() {
        let d = abc();
        let p = cluster(&d, 0.9, Some(&ab_close()));
        assert_eq!(p.len(), 2);
        assert_eq!(p.clusters[0].members, vec![0, 1]);
        assert!((p.clusters[0].mass - 0.9).abs() < 1e-12);
        assert_eq!(p.clusters[0].representative, "A");
        assert_eq!(p.clusters[1].members, vec![2]);
        assert!(!p.fallback);
        assert!(p.is_partition_of(&d));
        let h = semantic_entropy(&p);
        assert!((h - 0.3251).abs() < 1e-4);
        assert!(h < raw_entropy(&d));
    }

    #[test]
    fn test_centroid_is_unweighted_mean() {
        let d = abc();
        let p = cluster(&d, 0.9, Some(&ab_close()));
        let c = &p.clusters[0].centroid;
        assert!((c[0] - 0.975).abs() < 1e-6);
        assert!((c[1] - 0.025).abs() < 1e-6);
    }

    #[test]
    fn test_embedder_failure_falls_back() {
        let d = abc();
        let broken = ExternalEmbedder::new(|_| Err("model offline".into()));
        let p = cluster(&d, 0.5, Some(&broken));
        assert!(p.fallback);
        assert!(p.all_singletons());
        assert!((semantic_entropy(&p) - raw_entropy(&d)).abs() < 1e-12);
    }

    #[test]
    fn test_no_embedder_falls_back() {
        let d = abc();
        let p = cluster(&d, 0.5, None);
        assert!(p.fallback);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_inconsistent_dimensions_fall_back() {
        let d = abc();
        let e = ExternalEmbedder::new(|t| Ok(if t == "B" { vec![1.0] } else { vec![1.0, 0.0] }));
        assert!(cluster(&d, 0.5, Some(&e)).fallback);
    }

    #[test]
    fn test_tie_prefers_earliest_cluster() {
        // A and B are orthogonal (two clusters); C is equally similar to both.
        let d = abc();
        let e = ExternalEmbedder::new(|t| match t {
            "A" => Ok(vec![1.0, 0.0]),
            "B" => Ok(vec![0.0, 1.0]),
            _ => Ok(vec![1.0, 1.0]),
        });
        let p = cluster(&d, 0.5, Some(&e));
        assert_eq!(p.len(), 2);
        assert_eq!(p.clusters[0].members, vec![0, 2]);
        assert_eq!(p.clusters[1].members, vec![1]);
    }

    #[test]
    fn test_highest_similarity_wins_over_earliest() {
        let d = abc();
        let e = ExternalEmbedder::new(|t| match t {
            "A" => Ok(vec![1.0, 0.0]),
            "B" => Ok(vec![0.0, 1.0]),
            _ => Ok(vec![0.6, 0.8]),
        });
        let p = cluster(&d, 0.5, Some(&e));
        assert_eq!(p.clusters[1].members, vec![1, 2]);
    }

    #[test]
    fn test_threshold_one_only_identical_merge() {
        let scores = RawScores::probabilities([(" Paris", 0.5), ("paris", 0.3), ("Lyon", 0.2)]);
        let d = capture(0, &scores, 3, 0.0).unwrap();
        let p = cluster(&d, 0.999, Some(&NgramEmbedder::default()));
        assert_eq!(p.clusters[0].members, vec![0, 1]);
        assert!(p.is_partition_of(&d));
    }

    #[test]
    fn test_residual_stays_separate() {
        let d = capture(0, &RawScores::probabilities([("A", 0.5), ("B", 0.3)]), 5, 0.0).unwrap();
        let e = ExternalEmbedder::new(|_| Ok(vec![1.0, 0.0]));
        let p = cluster(&d, 0.5, Some(&e));
        assert_eq!(p.len(), 1);
        assert!((p.residual_mass - 0.2).abs() < 1e-9);
        assert!((p.clusters[0].mass - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_precomputed_embeddings_skip_embedder() {
        let mut d = abc();
        for (c, v) in d.candidates.iter_mut().zip([[1.0, 0.0], [1.0, 0.0], [0.0, 1.0]]) {
            c.embedding = Some(v.to_vec());
        }
        let p = cluster(&d, 0.9, None);
        assert!(!p.fallback);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_deterministic() {
        let d = abc();
        let e = ab_close();
        assert_eq!(cluster(&d, 0.9, Some(&e)), cluster(&d, 0.9, Some(&e)));
    }

    #[test]
    fn test_partition_property_random_shapes() {
        let e = NgramEmbedder::new(64, 2);
        let words = ["the", "The", " the", "a", "an", "this", "these", "that", "those"];
        for threshold in [0.0, 0.3, 0.6, 0.9, 1.0] {
            let scores = RawScores::logits(words.iter().enumerate().map(|(i, w)| (*w, -(i as f64) * 0.3)));
            let d = capture(0, &scores, 6, 0.0).unwrap();
            let p = cluster(&d, threshold, Some(&e));
            assert!(p.is_partition_of(&d), "threshold {threshold}");
            assert!(semantic_entropy(&p) <= raw_entropy(&d) + 1e-12);
        }
    }
}
