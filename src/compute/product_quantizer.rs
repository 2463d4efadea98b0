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

//! Product quantization of transformed fragments
//!
//! A `D`-dimensional vector is cut into `M` contiguous sub-vectors of `dsub = D / M`
//! floats. Each sub-quantizer owns `ksub <= 256` centroids, so a fragment encodes to
//! `M` bytes. Approximate distances come from a per-query lookup table holding the
//! squared distance from each query sub-vector to every centroid.

use crate::compute::distance::{nearest_row, squared_euclidean};
use crate::compute::kmeans::{KMeansConfig, KMeansTrainer};
use crate::core::error::BuildError;

pub const MAX_CENTROIDS: usize = 256;

/// Trained product quantizer. Centroids are stored flat, sub-quantizer major:
/// `[sub][centroid][dsub]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    num_sub_quantizers: usize,
    sub_dimension: usize,
    ksub: usize,
    centroids: Vec<f32>,
}

/// Squared distances from one query to every centroid of every sub-quantizer.
#[derive(Debug, Clone)]
pub struct DistanceTable {
    ksub: usize,
    table: Vec<f32>,
}

impl DistanceTable {
    /// Sum of table entries selected by `codes`; `O(M)`.
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        codes
            .iter()
            .enumerate()
            .map(|(sub, &code)| self.table[sub * self.ksub + code as usize])
            .sum()
    }
}

impl ProductQuantizer {
    pub fn from_parts(
        num_sub_quantizers: usize,
        sub_dimension: usize,
        ksub: usize,
        centroids: Vec<f32>,
    ) -> Result<Self, BuildError> {
        if num_sub_quantizers == 0 || sub_dimension == 0 || ksub == 0 || ksub > MAX_CENTROIDS {
            return Err(BuildError::Internal(format!(
                "invalid product quantizer shape M={} dsub={} ksub={}",
                num_sub_quantizers, sub_dimension, ksub
            )));
        }
        if centroids.len() != num_sub_quantizers * ksub * sub_dimension {
            return Err(BuildError::Internal(format!(
                "expected {} centroid floats, got {}",
                num_sub_quantizers * ksub * sub_dimension,
                centroids.len()
            )));
        }
        Ok(Self {
            num_sub_quantizers,
            sub_dimension,
            ksub,
            centroids,
        })
    }

    /// Trains all sub-quantizers serially on `samples` (flat, `dimension` floats each).
    pub fn train(
        samples: &[f32],
        dimension: usize,
        num_sub_quantizers: usize,
        ksub: usize,
        config: &KMeansConfig,
    ) -> Result<Self, BuildError> {
        let sub_dimension = sub_dimension(dimension, num_sub_quantizers)?;
        let mut centroids = Vec::with_capacity(num_sub_quantizers * ksub * sub_dimension);
        for sub in 0..num_sub_quantizers {
            let trainer = KMeansTrainer::new(KMeansConfig {
                seed: sub_quantizer_seed(config.seed, sub),
                ..config.clone()
            });
            let sub_samples = sub_vectors(samples, dimension, sub_dimension, sub);
            let result = trainer.train(&sub_samples, sub_dimension, ksub)?;
            centroids.extend_from_slice(&result.centroids);
        }
        Self::from_parts(num_sub_quantizers, sub_dimension, ksub, centroids)
    }

    pub fn num_sub_quantizers(&self) -> usize {
        self.num_sub_quantizers
    }

    pub fn sub_dimension(&self) -> usize {
        self.sub_dimension
    }

    pub fn dimension(&self) -> usize {
        self.num_sub_quantizers * self.sub_dimension
    }

    pub fn ksub(&self) -> usize {
        self.ksub
    }

    pub fn all_centroids(&self) -> &[f32] {
        &self.centroids
    }

    /// Centroid table of one sub-quantizer, `ksub x dsub` floats.
    pub fn centroids(&self, sub: usize) -> &[f32] {
        let size = self.ksub * self.sub_dimension;
        &self.centroids[sub * size..(sub + 1) * size]
    }

    pub fn encode_into(&self, vector: &[f32], codes: &mut [u8]) {
        debug_assert_eq!(vector.len(), self.dimension());
        for (sub, (code, part)) in codes
            .iter_mut()
            .zip(vector.chunks_exact(self.sub_dimension))
            .enumerate()
        {
            let (best, _) = nearest_row(part, self.centroids(sub), self.sub_dimension);
            *code = best as u8;
        }
    }

    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = vec![0u8; self.num_sub_quantizers];
        self.encode_into(vector, &mut codes);
        codes
    }

    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension());
        for (sub, &code) in codes.iter().enumerate() {
            let table = self.centroids(sub);
            let start = code as usize * self.sub_dimension;
            vector.extend_from_slice(&table[start..start + self.sub_dimension]);
        }
        vector
    }

    pub fn distance_table(&self, query: &[f32]) -> DistanceTable {
        let mut table = Vec::with_capacity(self.num_sub_quantizers * self.ksub);
        for (sub, part) in query.chunks_exact(self.sub_dimension).enumerate() {
            for centroid in self.centroids(sub).chunks_exact(self.sub_dimension) {
                table.push(squared_euclidean(part, centroid));
            }
        }
        DistanceTable {
            ksub: self.ksub,
            table,
        }
    }
}

/// `D / M`, rejecting shapes that do not divide evenly.
pub fn sub_dimension(dimension: usize, num_sub_quantizers: usize) -> Result<usize, BuildError> {
    if num_sub_quantizers == 0 || dimension == 0 || dimension % num_sub_quantizers != 0 {
        return Err(BuildError::Internal(format!(
            "dimension {} is not divisible into {} sub-quantizers",
            dimension, num_sub_quantizers
        )));
    }
    Ok(dimension / num_sub_quantizers)
}

/// Gathers sub-vector `sub` of every sample into a contiguous buffer.
pub fn sub_vectors(samples: &[f32], dimension: usize, sub_dimension: usize, sub: usize) -> Vec<f32> {
    let start = sub * sub_dimension;
    samples
        .chunks_exact(dimension)
        .flat_map(|sample| sample[start..start + sub_dimension].iter().copied())
        .collect()
}

/// Per-sub-quantizer seed so sub-quantizers train independently of scheduling order.
pub fn sub_quantizer_seed(seed: u64, sub: usize) -> u64 {
    seed.wrapping_add((sub as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}
