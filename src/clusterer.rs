//! Sequential-leader online speaker clustering with centroid updating.
//!
//! Ported from the reference `OnlineClusterer`/`cosine_distance`: a
//! streaming algorithm that assigns each incoming voice embedding to the
//! nearest existing cluster (by cosine distance) or starts a new one, with
//! a duration-scaled threshold that pins very short segments to whichever
//! cluster was chosen last.

use crate::error::{Error, Result};
use rand::Rng;
use std::collections::HashMap;

/// A speaker cluster: a running-mean centroid plus how many embeddings have
/// contributed to it.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: u64,
    pub centroid: Vec<f32>,
    pub sample_count: u64,
}

#[derive(Debug, Clone)]
pub struct OnlineClustererOptions {
    pub embedding_size: usize,
    pub threshold: f32,
}

impl Default for OnlineClustererOptions {
    fn default() -> Self {
        Self {
            embedding_size: 512,
            threshold: 0.8,
        }
    }
}

const SCALE_MIN: f32 = 2.0;
const SCALE_MAX: f32 = 3.0;
const DURATION_MIN: f32 = 1.0;
const THRESHOLD_MAX: f32 = 1.5;

/// Computes cosine distance `1 - (a.b)/(|a||b|)`.
///
/// Matches `scipy.spatial.distance.cdist(..., metric="cosine")`: returns 0
/// when either vector has zero norm, rather than propagating NaN.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::InvalidArgument(format!(
            "cosine distance: vectors must have the same length ({} vs {})",
            a.len(),
            b.len()
        )));
    }

    let mut dot = 0.0f32;
    let mut norm_a_sq = 0.0f32;
    let mut norm_b_sq = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a_sq += x * x;
        norm_b_sq += y * y;
    }

    let norm_a = norm_a_sq.sqrt();
    let norm_b = norm_b_sq.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    let similarity = dot / (norm_a * norm_b);
    Ok(1.0 - similarity)
}

pub struct OnlineClusterer {
    clusters: HashMap<u64, Cluster>,
    options: OnlineClustererOptions,
    previous_cluster_id: Option<u64>,
}

impl OnlineClusterer {
    pub fn new(options: OnlineClustererOptions) -> Self {
        Self {
            clusters: HashMap::new(),
            options,
            previous_cluster_id: None,
        }
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// Assigns `embedding` (from a segment of `audio_duration_s` seconds) to
    /// a cluster id, creating a new cluster if nothing is close enough.
    pub fn embed_and_cluster(&mut self, embedding: &[f32], audio_duration_s: f32) -> Result<u64> {
        if embedding.len() != self.options.embedding_size {
            return Err(Error::InvalidArgument(format!(
                "embedding size {} must match the configured embedding size {}",
                embedding.len(),
                self.options.embedding_size
            )));
        }

        let mut min_distance = f32::MAX;
        let mut closest_cluster_id = 0u64;
        let mut found_cluster = false;
        for cluster in self.clusters.values() {
            let distance = cosine_distance(embedding, &cluster.centroid)?;
            if distance < min_distance {
                min_distance = distance;
                closest_cluster_id = cluster.id;
                found_cluster = true;
            }
        }

        let current_threshold = if audio_duration_s > SCALE_MAX {
            self.options.threshold
        } else if audio_duration_s > SCALE_MIN {
            let scale_factor = (audio_duration_s - SCALE_MIN) / (SCALE_MAX - SCALE_MIN);
            self.options.threshold * scale_factor + THRESHOLD_MAX * (1.0 - scale_factor)
        } else if audio_duration_s > DURATION_MIN {
            THRESHOLD_MAX
        } else if let Some(previous) = self.previous_cluster_id {
            return Ok(previous);
        } else {
            THRESHOLD_MAX
        };

        let result_cluster_id = if found_cluster && min_distance < current_threshold {
            let cluster = self.clusters.get_mut(&closest_cluster_id).unwrap();
            let n = cluster.sample_count;
            let scale_old = n as f32 / (n + 1) as f32;
            let scale_new = 1.0 / (n + 1) as f32;
            for (c, e) in cluster.centroid.iter_mut().zip(embedding.iter()) {
                *c = scale_old * *c + scale_new * e;
            }
            cluster.sample_count += 1;
            closest_cluster_id
        } else {
            let new_id: u64 = rand::thread_rng().gen();
            self.clusters.insert(
                new_id,
                Cluster {
                    id: new_id,
                    centroid: embedding.to_vec(),
                    sample_count: 1,
                },
            );
            new_id
        };

        self.previous_cluster_id = Some(result_cluster_id);
        Ok(result_cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> OnlineClustererOptions {
        OnlineClustererOptions {
            embedding_size: 3,
            threshold: 0.2,
        }
    }

    #[test]
    fn cosine_distance_identical_is_zero() {
        let a = vec![1.0, 2.0, 3.0];
        assert!(cosine_distance(&a, &a).unwrap().abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_orthogonal_is_one() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_distance(&a, &b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_anti_parallel_is_two() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_distance(&a, &b).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_zero_norm_is_zero() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_distance(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn cosine_distance_mismatched_lengths_errors() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!(cosine_distance(&a, &b).is_err());
    }

    #[test]
    fn first_embedding_creates_a_new_cluster() {
        let mut clusterer = OnlineClusterer::new(opts());
        let id = clusterer.embed_and_cluster(&[1.0, 0.0, 0.0], 5.0).unwrap();
        assert_eq!(clusterer.clusters().count(), 1);
        let id2 = clusterer.embed_and_cluster(&[1.0, 0.0, 0.0], 5.0).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn distant_embedding_creates_second_cluster() {
        let mut clusterer = OnlineClusterer::new(opts());
        let first = clusterer.embed_and_cluster(&[1.0, 0.0, 0.0], 5.0).unwrap();
        let second = clusterer.embed_and_cluster(&[0.0, 1.0, 0.0], 5.0).unwrap();
        assert_ne!(first, second);
        assert_eq!(clusterer.clusters().count(), 2);
    }

    #[test]
    fn short_segments_after_a_long_one_stick_to_previous_cluster() {
        let mut clusterer = OnlineClusterer::new(opts());
        let first = clusterer.embed_and_cluster(&[1.0, 0.0, 0.0], 5.0).unwrap();
        for _ in 0..5 {
            let id = clusterer
                .embed_and_cluster(&[0.0, 1.0, 0.0], 0.5)
                .unwrap();
            assert_eq!(id, first);
        }
    }

    #[test]
    fn dimension_mismatch_errors() {
        let mut clusterer = OnlineClusterer::new(opts());
        assert!(clusterer.embed_and_cluster(&[1.0, 0.0], 5.0).is_err());
    }
}
