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

//! Synthetic clips shared by integration tests and benches

#![allow(dead_code)]

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use std::f32::consts::TAU;

use motiondb::builder::{Annotation, SampledClip, SkeletonSampler, WorkerPool};
use motiondb::core::config::{BuildConfig, SearchConfig};
use motiondb::core::registry::{Idle, Locomotion, TypeRegistry};
use motiondb::features::{Joint, MetricDefinition, Rig, Transform};
use motiondb::{Binary, Builder, NeverCancel};

pub const SAMPLE_RATE: f32 = 30.0;

/// Root, hips and two feet; matches the default locomotion metric.
pub fn rig() -> Rig {
    let joint = |name: &str, parent: Option<usize>| Joint {
        name: name.to_string(),
        parent,
    };
    Rig::new(vec![
        joint("Root", None),
        joint("Hips", Some(0)),
        joint("LeftFoot", Some(1)),
        joint("RightFoot", Some(1)),
    ])
    .unwrap()
}

fn pose(root: Transform, phase: f32, stride: f32) -> Vec<Transform> {
    let swing = stride * phase.sin();
    vec![
        root,
        Isometry3::translation(0.0, 0.9, 0.0),
        Isometry3::translation(0.15, -0.85, swing),
        Isometry3::translation(-0.15, -0.85, -swing),
    ]
}

/// Straight walk along +Z with a 0.7 Hz step cycle.
pub fn straight_walk(name: &str, num_frames: usize, speed: f32) -> SampledClip {
    let frames = (0..num_frames)
        .map(|frame| {
            let t = frame as f32 / SAMPLE_RATE;
            pose(Isometry3::translation(0.0, 0.0, speed * t), TAU * 0.7 * t, 0.3)
        })
        .collect();
    SampledClip::new(name, frames)
}

/// Walk turning left around a circle of `radius`.
pub fn circle_walk(name: &str, num_frames: usize, radius: f32, angular_speed: f32) -> SampledClip {
    let frames = (0..num_frames)
        .map(|frame| {
            let t = frame as f32 / SAMPLE_RATE;
            let yaw = angular_speed * t;
            let root = Isometry3::from_parts(
                Translation3::new(radius * (1.0 - yaw.cos()), 0.0, radius * yaw.sin()),
                UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw),
            );
            pose(root, TAU * 0.9 * t, 0.25)
        })
        .collect();
    SampledClip::new(name, frames)
}

/// Standing still with a slight sway; loops onto itself.
pub fn idle(name: &str, num_frames: usize) -> SampledClip {
    let frames = (0..num_frames)
        .map(|frame| {
            let t = frame as f32 / SAMPLE_RATE;
            pose(Isometry3::translation(0.0, 0.0, 0.0), TAU * 0.25 * t, 0.02)
        })
        .collect();
    SampledClip::new(name, frames).with_next(name)
}

pub struct Library {
    pub clips: Vec<SampledClip>,
    pub annotations: Vec<Annotation>,
}

impl Library {
    pub fn samplers(&self) -> Vec<&dyn SkeletonSampler> {
        self.clips.iter().map(|c| c as &dyn SkeletonSampler).collect()
    }
}

/// `walk` and `circle` tagged Locomotion, `idle` tagged Idle.
pub fn library(registry: &TypeRegistry) -> Library {
    let clips = vec![
        straight_walk("walk", 90, 1.5),
        circle_walk("circle", 120, 2.0, 0.8),
        idle("idle", 60),
    ];
    let locomotion = registry.encode(&Locomotion {}).unwrap();
    let idle = registry.encode(&Idle {}).unwrap();
    let annotations = vec![
        Annotation::tag("walk", locomotion.clone(), 0, 90),
        Annotation::tag("circle", locomotion, 0, 120),
        Annotation::tag("idle", idle, 0, 60),
    ];
    Library { clips, annotations }
}

pub fn build_config() -> BuildConfig {
    let mut metric = MetricDefinition::default_locomotion();
    metric.ksub = 32;
    BuildConfig {
        sample_rate: SAMPLE_RATE,
        kmeans_iterations: 10,
        fragment_chunk_size: 32,
        worker_threads: 2,
        metrics: vec![metric],
        ..BuildConfig::default()
    }
}

pub fn search_config() -> SearchConfig {
    SearchConfig {
        max_approximate_candidates: 64,
        ..SearchConfig::default()
    }
}

pub fn build_binary() -> Binary {
    let registry = TypeRegistry::with_builtins();
    let pool = WorkerPool::new(2).unwrap();
    let library = library(&registry);
    let builder = Builder::new(build_config(), &registry, &pool).unwrap();
    builder
        .build(rig(), &library.samplers(), &library.annotations, &NeverCancel)
        .unwrap()
}
