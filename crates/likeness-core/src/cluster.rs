//! Density-based clustering (DBSCAN) over face embeddings.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::Embedding;

/// Distance used to build ε-neighbourhoods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine similarity`; native for L2-normalized embeddings.
    Cosine,
    /// Straight-line distance; native for raw embeddings.
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Cosine => a.cosine_distance(b),
            DistanceMetric::Euclidean => a.euclidean_distance(b),
        }
    }
}

/// Cluster assignment for one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterLabel {
    Noise,
    Cluster(usize),
}

impl ClusterLabel {
    /// Numeric label with `-1` for noise.
    pub fn as_i64(self) -> i64 {
        match self {
            ClusterLabel::Noise => -1,
            ClusterLabel::Cluster(id) => id as i64,
        }
    }
}

/// Label every point with DBSCAN.
///
/// A point's neighbourhood includes itself; it is a core point when the
/// neighbourhood holds at least `min_samples` points. Clusters are numbered
/// in discovery order while scanning `points` front to back, and a border
/// point belongs to the first cluster that reaches it.
pub fn dbscan(
    points: &[&Embedding],
    eps: f32,
    min_samples: usize,
    metric: DistanceMetric,
) -> Vec<ClusterLabel> {
    let n = points.len();

    let neighbors: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| i == j || metric.distance(points[i], points[j]) <= eps)
                .collect()
        })
        .collect();

    let mut labels: Vec<Option<ClusterLabel>> = vec![None; n];
    let mut next_cluster = 0usize;

    for i in 0..n {
        if labels[i].is_some() {
            continue;
        }
        if neighbors[i].len() < min_samples {
            labels[i] = Some(ClusterLabel::Noise);
            continue;
        }

        let cluster = ClusterLabel::Cluster(next_cluster);
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut queue: VecDeque<usize> = neighbors[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Some(ClusterLabel::Cluster(_)) => {}
                // Noise reachable from a core point is a border point.
                Some(ClusterLabel::Noise) => labels[j] = Some(cluster),
                None => {
                    labels[j] = Some(cluster);
                    if neighbors[j].len() >= min_samples {
                        queue.extend(neighbors[j].iter().copied());
                    }
                }
            }
        }
    }

    labels
        .into_iter()
        .map(|l| l.unwrap_or(ClusterLabel::Noise))
        .collect()
}

/// The most populated non-noise cluster as `(cluster id, size)`.
///
/// Ties go to the lowest cluster id. `None` when everything is noise.
pub fn majority_cluster(labels: &[ClusterLabel]) -> Option<(usize, usize)> {
    let clusters = labels
        .iter()
        .filter_map(|l| match l {
            ClusterLabel::Cluster(id) => Some(*id),
            ClusterLabel::Noise => None,
        })
        .max()?;

    let mut counts = vec![0usize; clusters + 1];
    for label in labels {
        if let ClusterLabel::Cluster(id) = label {
            counts[*id] += 1;
        }
    }

    let mut best = (0usize, counts[0]);
    for (id, &count) in counts.iter().enumerate().skip(1) {
        if count > best.1 {
            best = (id, count);
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[test]
    fn test_two_clusters_and_noise() {
        let pts = [
            emb(&[0.0, 0.0]),
            emb(&[0.1, 0.0]),
            emb(&[0.0, 0.1]),
            emb(&[10.0, 10.0]),
            emb(&[10.1, 10.0]),
            emb(&[50.0, -50.0]),
        ];
        let refs: Vec<&Embedding> = pts.iter().collect();
        let labels = dbscan(&refs, 0.5, 2, DistanceMetric::Euclidean);
        assert_eq!(
            labels,
            vec![
                ClusterLabel::Cluster(0),
                ClusterLabel::Cluster(0),
                ClusterLabel::Cluster(0),
                ClusterLabel::Cluster(1),
                ClusterLabel::Cluster(1),
                ClusterLabel::Noise,
            ]
        );
        assert_eq!(majority_cluster(&labels), Some((0, 3)));
    }

    #[test]
    fn test_border_point_joins_cluster() {
        // Chain 0 - 1 - 2 with eps 1.0: only the middle point is core for min_samples 3.
        let pts = [emb(&[0.0]), emb(&[1.0]), emb(&[2.0])];
        let refs: Vec<&Embedding> = pts.iter().collect();
        let labels = dbscan(&refs, 1.0, 3, DistanceMetric::Euclidean);
        assert_eq!(labels, vec![ClusterLabel::Cluster(0); 3]);
    }

    #[test]
    fn test_all_noise() {
        let pts = [emb(&[1.0, 0.0]), emb(&[0.0, 1.0]), emb(&[-1.0, 0.0])];
        let refs: Vec<&Embedding> = pts.iter().collect();
        let labels = dbscan(&refs, 0.3, 2, DistanceMetric::Cosine);
        assert!(labels.iter().all(|l| *l == ClusterLabel::Noise));
        assert_eq!(majority_cluster(&labels), None);
    }

    #[test]
    fn test_min_samples_one_makes_singletons() {
        let pts = [emb(&[1.0, 0.0]), emb(&[0.0, 1.0])];
        let refs: Vec<&Embedding> = pts.iter().collect();
        let labels = dbscan(&refs, 0.1, 1, DistanceMetric::Cosine);
        assert_eq!(labels, vec![ClusterLabel::Cluster(0), ClusterLabel::Cluster(1)]);
    }

    #[test]
    fn test_majority_tie_prefers_first_cluster() {
        let labels = [
            ClusterLabel::Cluster(1),
            ClusterLabel::Cluster(0),
            ClusterLabel::Noise,
            ClusterLabel::Cluster(1),
            ClusterLabel::Cluster(0),
        ];
        assert_eq!(majority_cluster(&labels), Some((0, 2)));
    }

    #[test]
    fn test_cosine_metric_ignores_scale() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[5.0, 0.0]);
        assert!(DistanceMetric::Cosine.distance(&a, &b).abs() < 1e-6);
        assert!((DistanceMetric::Euclidean.distance(&a, &b) - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_noise_label_value() {
        assert_eq!(ClusterLabel::Noise.as_i64(), -1);
        assert_eq!(ClusterLabel::Cluster(3).as_i64(), 3);
    }
}
