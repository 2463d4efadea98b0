/*
 * Copyright 2025 Vijaykumar Singh
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! K-means training for product-quantizer codebooks
//!
//! Fixed-iteration Lloyd's algorithm over a flat `n x d` sample array. Initial
//! centroids come from a seeded random permutation of the samples, and several
//! attempts may be run, keeping the one with the lowest error. Empty clusters
//! are repaired every iteration by splitting a populated cluster, so every
//! returned cluster owns at least one sample.

use rand::prelude::*;
use rand::seq::index;
use tracing::debug;

use crate::compute::distance::nearest_row;
use crate::core::error::BuildError;

/// K-means training configuration
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Independent restarts; the lowest-error attempt wins
    pub num_attempts: usize,
    /// Lloyd iterations per attempt
    pub num_iterations: usize,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Perturbation applied to both halves of a split cluster
    pub split_epsilon: f32,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            num_attempts: 1,
            num_iterations: 25,
            seed: 42,
            split_epsilon: 1.0 / 1024.0,
        }
    }
}

/// Trained centroids and training diagnostics
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Flat `k x dimension` centroid table
    pub centroids: Vec<f32>,
    /// Cluster sizes as tracked by the final iteration. A cluster filled by an
    /// empty-cluster split reports half of its donor's members, not a
    /// re-measured count against the returned centroids.
    pub counts: Vec<usize>,
    /// Total squared error of the retained attempt
    pub error: f32,
    pub attempt_errors: Vec<f32>,
    pub dimension: usize,
}

impl KMeansResult {
    pub fn k(&self) -> usize {
        self.counts.len()
    }

    pub fn centroid(&self, cluster: usize) -> &[f32] {
        &self.centroids[cluster * self.dimension..(cluster + 1) * self.dimension]
    }
}

#[derive(Debug, Clone)]
pub struct KMeansTrainer {
    config: KMeansConfig,
}

impl KMeansTrainer {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    /// Clusters `samples` (flat, `dimension` floats each) into `k` centroids.
    pub fn train(
        &self,
        samples: &[f32],
        dimension: usize,
        k: usize,
    ) -> Result<KMeansResult, BuildError> {
        if dimension == 0 {
            return Err(BuildError::KMeans("cannot train on zero-dimensional samples".to_string()));
        }
        if samples.len() % dimension != 0 {
            return Err(BuildError::KMeans(format!(
                "sample buffer of {} floats is not a multiple of dimension {}",
                samples.len(),
                dimension
            )));
        }
        let n = samples.len() / dimension;
        if n == 0 {
            return Err(BuildError::KMeans("cannot train on an empty sample set".to_string()));
        }
        if k == 0 || k > n {
            return Err(BuildError::KMeans(format!(
                "cluster count {} must be within 1..={} samples",
                k, n
            )));
        }

        debug!(
            "🧠 Training K-means: {} samples, {} dimensions, {} clusters, {} attempts",
            n, dimension, k, self.config.num_attempts
        );

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut attempt_errors = Vec::with_capacity(self.config.num_attempts.max(1));
        let mut best: Option<(Vec<f32>, Vec<usize>, f32)> = None;

        for attempt in 0..self.config.num_attempts.max(1) {
            let (centroids, counts, error) = self.run_attempt(samples, n, dimension, k, &mut rng);
            debug!("K-means attempt {}: error = {:.6}", attempt + 1, error);
            attempt_errors.push(error);

            let improves = match &best {
                Some((_, _, best_error)) => error < *best_error,
                None => true,
            };
            if improves {
                best = Some((centroids, counts, error));
            }
        }

        let (centroids, counts, error) = best.ok_or_else(|| {
            BuildError::KMeans("no K-means attempt produced a result".to_string())
        })?;

        Ok(KMeansResult {
            centroids,
            counts,
            error,
            attempt_errors,
            dimension,
        })
    }

    fn run_attempt(
        &self,
        samples: &[f32],
        n: usize,
        d: usize,
        k: usize,
        rng: &mut StdRng,
    ) -> (Vec<f32>, Vec<usize>, f32) {
        let mut centroids = Vec::with_capacity(k * d);
        for sample in index::sample(rng, n, k).into_iter() {
            centroids.extend_from_slice(&samples[sample * d..(sample + 1) * d]);
        }

        let mut assignments = vec![0usize; n];
        let mut counts = vec![0usize; k];
        let mut error = 0.0;

        for iteration in 0..self.config.num_iterations.max(1) {
            error = measure_centroids(samples, d, &centroids, &mut assignments);
            update_centroids(samples, d, &assignments, &mut centroids, &mut counts);
            let split = split_empty_clusters(
                &mut centroids,
                &mut counts,
                n,
                d,
                self.config.split_epsilon,
                rng,
            );
            if split > 0 {
                debug!("K-means iteration {}: split {} empty clusters", iteration + 1, split);
            }
        }

        (centroids, counts, error)
    }
}

/// Assigns every sample to its nearest centroid and returns the total squared error.
pub fn measure_centroids(
    samples: &[f32],
    dimension: usize,
    centroids: &[f32],
    assignments: &mut [usize],
) -> f32 {
    let mut total = 0.0;
    for (sample, assignment) in samples.chunks_exact(dimension).zip(assignments.iter_mut()) {
        let (cluster, distance) = nearest_row(sample, centroids, dimension);
        *assignment = cluster;
        total += distance;
    }
    total
}

/// Recomputes each centroid as the mean of its members. Empty clusters keep
/// their previous centroid and a zero count.
fn update_centroids(
    samples: &[f32],
    dimension: usize,
    assignments: &[usize],
    centroids: &mut [f32],
    counts: &mut [usize],
) {
    let mut sums = vec![0.0f32; centroids.len()];
    counts.iter_mut().for_each(|count| *count = 0);

    for (sample, &cluster) in samples.chunks_exact(dimension).zip(assignments) {
        counts[cluster] += 1;
        let sum = &mut sums[cluster * dimension..(cluster + 1) * dimension];
        for (acc, value) in sum.iter_mut().zip(sample) {
            *acc += value;
        }
    }

    for (cluster, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let range = cluster * dimension..(cluster + 1) * dimension;
        for (centroid, sum) in centroids[range.clone()].iter_mut().zip(&sums[range]) {
            *centroid = sum / count as f32;
        }
    }
}

/// Gives every empty cluster half of a populated one.
///
/// The donor is picked by walking the clusters and accepting cluster `j` with
/// probability `(count_j - 1) / max(n - k, 1)`, so singletons never donate.
/// Donor and receiver move apart by `epsilon` in alternating directions per
/// dimension. Returns the number of clusters split.
fn split_empty_clusters(
    centroids: &mut [f32],
    counts: &mut [usize],
    n: usize,
    dimension: usize,
    epsilon: f32,
    rng: &mut StdRng,
) -> usize {
    let k = counts.len();
    let denominator = n.saturating_sub(k).max(1) as f32;
    let mut split = 0;

    for empty in 0..k {
        if counts[empty] != 0 {
            continue;
        }
        if !counts.iter().any(|&count| count > 1) {
            break;
        }

        let mut donor = 0;
        loop {
            let probability = (counts[donor] as f32 - 1.0) / denominator;
            if rng.gen::<f32>() < probability {
                break;
            }
            donor = (donor + 1) % k;
        }

        for j in 0..dimension {
            let value = centroids[donor * dimension + j];
            let offset = if j % 2 == 0 { epsilon } else { -epsilon };
            centroids[empty * dimension + j] = value + offset;
            centroids[donor * dimension + j] = value - offset;
        }

        counts[empty] = counts[donor] / 2;
        counts[donor] -= counts[empty];
        split += 1;
    }

    split
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trainer(attempts: usize) -> KMeansTrainer {
        KMeansTrainer::new(KMeansConfig {
            num_attempts: attempts,
            num_iterations: 20,
            seed: 7,
            ..KMeansConfig::default()
        })
    }

    #[test]
    fn test_kmeans_clustering() {
        let samples = vec![
            1.0, 1.0, //
            1.1, 1.1, //
            0.9, 0.9, //
            10.0, 10.0, //
            10.1, 10.1, //
            9.9, 9.9,
        ];

        let result = trainer(3).train(&samples, 2, 2).unwrap();
        assert_eq!(result.k(), 2);
        assert_eq!(result.counts.iter().sum::<usize>(), 6);
        assert!(result.counts.iter().all(|&c| c == 3));
        assert!(result.error < 0.1);
    }

    #[test]
    fn test_invalid_inputs() {
        let trainer = trainer(1);
        assert!(matches!(trainer.train(&[], 2, 1), Err(BuildError::KMeans(_))));
        assert!(matches!(trainer.train(&[1.0, 2.0], 2, 2), Err(BuildError::KMeans(_))));
        assert!(matches!(trainer.train(&[1.0, 2.0, 3.0], 2, 1), Err(BuildError::KMeans(_))));
        assert!(matches!(trainer.train(&[1.0], 0, 1), Err(BuildError::KMeans(_))));
    }

    #[test]
    fn test_no_empty_cluster_when_k_equals_samples() {
        let samples: Vec<f32> = (0..8).flat_map(|i| [i as f32, 0.0, 0.0]).collect();
        let result = trainer(2).train(&samples, 3, 8).unwrap();
        assert!(result.counts.iter().all(|&c| c >= 1));
        assert_eq!(result.counts.iter().sum::<usize>(), 8);
    }

    #[test]
    fn test_duplicate_samples_are_split() {
        let samples = vec![0.5f32; 4 * 3];
        let result = trainer(1).train(&samples, 3, 3).unwrap();
        assert!(result.counts.iter().all(|&c| c >= 1));
        assert_ne!(result.centroid(0), result.centroid(1));
    }

    #[test]
    fn test_counts_match_assignment_without_splits() {
        let samples = vec![
            0.0, 0.0, //
            0.2, 0.1, //
            5.0, 5.0, //
            5.1, 4.9, //
            5.2, 5.0,
        ];
        let result = trainer(2).train(&samples, 2, 2).unwrap();

        let mut assignments = vec![0; 5];
        measure_centroids(&samples, 2, &result.centroids, &mut assignments);
        let mut measured = vec![0; 2];
        assignments.iter().for_each(|&cluster| measured[cluster] += 1);
        assert_eq!(result.counts, measured);
    }

    #[test]
    fn test_split_counts_are_bookkeeping() {
        let samples = vec![0.5f32; 4 * 3];
        let result = trainer(1).train(&samples, 3, 3).unwrap();
        assert_eq!(result.counts.iter().sum::<usize>(), 4);

        // Identical samples all land on one centroid when re-measured.
        let mut assignments = vec![0; 4];
        measure_centroids(&samples, 3, &result.centroids, &mut assignments);
        assert!(assignments.iter().all(|&cluster| cluster == assignments[0]));
        assert!(result.counts.iter().all(|&c| c >= 1 && c < 4));
    }

    #[test]
    fn test_best_attempt_retained() {
        let samples: Vec<f32> = (0..40)
            .flat_map(|i| {
                let x = (i % 5) as f32 * 3.0 + (i as f32 * 0.37).sin();
                [x, (i as f32 * 1.3).cos()]
            })
            .collect();
        let result = trainer(5).train(&samples, 2, 4).unwrap();
        assert_eq!(result.attempt_errors.len(), 5);
        assert!(result.attempt_errors.iter().all(|&e| result.error <= e));
    }

    #[test]
    fn test_deterministic_for_seed() {
        let samples: Vec<f32> = (0..30).map(|i| (i as f32 * 0.7).sin()).collect();
        let a = trainer(2).train(&samples, 3, 4).unwrap();
        let b = trainer(2).train(&samples, 3, 4).unwrap();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.counts, b.counts);
    }
}
