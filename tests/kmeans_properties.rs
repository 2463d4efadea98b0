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

//! Property tests for the quantization building blocks

use approx::assert_relative_eq;
use proptest::prelude::*;

use motiondb::compute::{KMeansConfig, KMeansTrainer, ProductQuantizer, Quantizer};

fn samples(dimension: usize) -> impl Strategy<Value = Vec<f32>> {
    (2usize..40).prop_flat_map(move |n| prop::collection::vec(-10.0f32..10.0, n * dimension))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_no_cluster_left_empty(data in samples(3), k_slack in 0usize..3, seed in any::<u64>()) {
        let n = data.len() / 3;
        let k = n.saturating_sub(k_slack).max(1);
        let trainer = KMeansTrainer::new(KMeansConfig {
            num_attempts: 2,
            num_iterations: 8,
            seed,
            ..KMeansConfig::default()
        });

        let result = trainer.train(&data, 3, k).unwrap();
        prop_assert_eq!(result.k(), k);
        prop_assert_eq!(result.centroids.len(), k * 3);
        prop_assert!(result.counts.iter().all(|&count| count >= 1));
        prop_assert_eq!(result.counts.iter().sum::<usize>(), n);
    }

    #[test]
    fn prop_retained_attempt_has_lowest_error(data in samples(2), attempts in 1usize..5, seed in any::<u64>()) {
        let k = (data.len() / 2).min(4);
        let trainer = KMeansTrainer::new(KMeansConfig {
            num_attempts: attempts,
            num_iterations: 5,
            seed,
            ..KMeansConfig::default()
        });

        let result = trainer.train(&data, 2, k).unwrap();
        prop_assert_eq!(result.attempt_errors.len(), attempts);
        prop_assert!(result.attempt_errors.iter().all(|&error| result.error <= error));
    }

    #[test]
    fn prop_training_is_reproducible(data in samples(2), seed in any::<u64>()) {
        let config = KMeansConfig { seed, num_iterations: 6, ..KMeansConfig::default() };
        let k = (data.len() / 2).min(5);
        let a = KMeansTrainer::new(config.clone()).train(&data, 2, k).unwrap();
        let b = KMeansTrainer::new(config).train(&data, 2, k).unwrap();
        prop_assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn prop_decoded_codes_encode_to_themselves(data in samples(4), point in prop::collection::vec(-12.0f32..12.0, 4)) {
        let ksub = (data.len() / 4).min(8);
        let config = KMeansConfig { num_iterations: 6, ..KMeansConfig::default() };
        let quantizer = ProductQuantizer::train(&data, 4, 2, ksub, &config).unwrap();

        let codes = quantizer.encode(&point);
        prop_assert_eq!(codes.len(), 2);
        prop_assert_eq!(quantizer.encode(&quantizer.decode(&codes)), codes.clone());

        // The lookup table agrees with the distance to the reconstruction.
        let reconstructed = quantizer.decode(&codes);
        let direct: f32 = point.iter().zip(&reconstructed).map(|(a, b)| (a - b) * (a - b)).sum();
        let table = quantizer.distance_table(&point);
        prop_assert!((table.distance(&codes) - direct).abs() <= 1.0e-3 * direct.max(1.0));
    }

    #[test]
    fn prop_magnitude_codes_are_stable(min in -5.0f32..5.0, range in 0.01f32..50.0, code in any::<u8>()) {
        let quantizer = Quantizer::new(min, range);
        let value = quantizer.decode(code);
        prop_assert!(value >= min - 1.0e-4 && value <= min + range + 1.0e-4);
        prop_assert_eq!(quantizer.encode(value), code);
        prop_assert!(quantizer.normalized_difference(value, min).abs() <= 1.0);
    }
}

#[test]
fn test_degenerate_quantizer() {
    let quantizer = Quantizer::from_values([2.5, 2.5, 2.5]);
    assert_eq!(quantizer.range, 0.0);
    assert_eq!(quantizer.encode(2.5), 0);
    assert_eq!(quantizer.encode(100.0), 0);
    assert_relative_eq!(quantizer.decode(200), 2.5);
    assert_eq!(quantizer.normalize(7.0), 0.0);
    assert_relative_eq!(quantizer.normalized_difference(3.0, 2.5), 0.5);
    assert_relative_eq!(quantizer.normalized_difference(0.0, 2.5), -1.0);

    let empty = Quantizer::from_values(std::iter::empty());
    assert_eq!(empty.range, 0.0);
}

#[test]
fn test_single_sample_single_cluster() {
    let result = KMeansTrainer::new(KMeansConfig::default())
        .train(&[1.0, 2.0, 3.0], 3, 1)
        .unwrap();
    assert_eq!(result.counts, vec![1]);
    assert_eq!(result.centroid(0), &[1.0f32, 2.0, 3.0][..]);
    assert_relative_eq!(result.error, 0.0);
    assert!(KMeansTrainer::new(KMeansConfig::default()).train(&[1.0, 2.0, 3.0], 3, 2).is_err());
}
