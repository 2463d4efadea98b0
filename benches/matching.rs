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

//! Build and search benchmarks over the synthetic clip library

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

#[path = "../tests/common/mod.rs"]
mod common;

use motiondb::builder::WorkerPool;
use motiondb::compute::{KMeansConfig, KMeansTrainer, ProductQuantizer};
use motiondb::core::registry::TypeRegistry;
use motiondb::core::types::{MetricIndex, SamplingTime};
use motiondb::features::{extract_pose_fragment, extract_trajectory_fragment};
use motiondb::search::{DesiredTrajectory, MatchQuery, MatchingEngine, PoseSample, TrajectoryPrediction};
use motiondb::{Builder, NeverCancel};

fn random_samples(count: usize, dimension: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count * dimension).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Full search per query, serial vs parallel codebook scan
pub fn benchmark_search(c: &mut Criterion) {
    let binary = common::build_binary();
    let walk = binary.find_segment("walk");
    let circle = binary.find_segment("circle");
    let queries: Vec<MatchQuery> = [(walk, 20), (circle, 60), (walk, 75)]
        .into_iter()
        .map(|(segment, frame)| {
            let time = SamplingTime::at_frame(segment, frame);
            let pose = extract_pose_fragment(&binary, MetricIndex(0), time).unwrap();
            let trajectory = extract_trajectory_fragment(&binary, MetricIndex(0), time).unwrap();
            MatchQuery::new(DesiredTrajectory::Fragment(trajectory)).with_pose(PoseSample::Fragment(pose))
        })
        .collect();

    let mut group = c.benchmark_group("search");
    group.measurement_time(Duration::from_secs(10));
    group.throughput(Throughput::Elements(queries.len() as u64));

    for parallel in [false, true] {
        let mut config = common::search_config();
        config.parallel_codebooks = parallel;
        let engine = MatchingEngine::new(&binary, config).unwrap();
        let label = if parallel { "parallel" } else { "serial" };

        group.bench_function(BenchmarkId::new("fragment_query", label), |b| {
            b.iter(|| {
                for query in &queries {
                    black_box(engine.search(SamplingTime::INVALID, black_box(query)));
                }
            })
        });
    }

    let engine = MatchingEngine::new(&binary, common::search_config()).unwrap();
    let prediction = TrajectoryPrediction::default();
    let current = SamplingTime::at_frame(walk, 30);
    group.bench_function("predicted_trajectory", |b| {
        b.iter(|| {
            let desired = prediction.desired_trajectory(
                nalgebra::Vector3::new(0.0, 0.0, 1.5),
                black_box(nalgebra::Vector3::new(0.8, 0.0, 1.0)),
                nalgebra::Vector3::new(0.8, 0.0, 1.0),
            );
            black_box(engine.search(current, &MatchQuery::new(desired)))
        })
    });

    group.finish();
}

/// End-to-end build of the three-clip library
pub fn benchmark_build(c: &mut Criterion) {
    let registry = TypeRegistry::with_builtins();
    let library = common::library(&registry);

    let mut group = c.benchmark_group("build");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    for workers in [1, 4] {
        let pool = WorkerPool::new(workers).unwrap();
        group.bench_with_input(BenchmarkId::new("library", workers), &workers, |b, _| {
            b.iter(|| {
                let builder = Builder::new(common::build_config(), &registry, &pool).unwrap();
                black_box(
                    builder
                        .build(common::rig(), &library.samplers(), &library.annotations, &NeverCancel)
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

/// K-means and product quantizer training on random data
pub fn benchmark_training(c: &mut Criterion) {
    let mut group = c.benchmark_group("training");

    for &(count, dimension) in &[(512usize, 6usize), (2048, 6), (2048, 24)] {
        let samples = random_samples(count, dimension);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(
            BenchmarkId::new("kmeans", format!("{}x{}", count, dimension)),
            &samples,
            |b, samples| {
                let trainer = KMeansTrainer::new(KMeansConfig::default());
                b.iter(|| black_box(trainer.train(samples, dimension, 64).unwrap()))
            },
        );

        group.bench_with_input(
            BenchmarkId::new("product_quantizer", format!("{}x{}", count, dimension)),
            &samples,
            |b, samples| {
                let config = KMeansConfig {
                    num_iterations: 10,
                    ..KMeansConfig::default()
                };
                b.iter(|| black_box(ProductQuantizer::train(samples, dimension, dimension / 3, 32, &config).unwrap()))
            },
        );
    }

    group.finish();
}

criterion_group!(matching_benches, benchmark_search, benchmark_build, benchmark_training);

criterion_main!(matching_benches);
