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

//! Feature fragments
//!
//! A fragment is a fixed-length list of 3D values describing either the pose
//! (joint positions and velocities) or the root trajectory (displacements and
//! facings) around one sampling time. The [`FragmentLayout`] of a metric gives
//! every slot a [`FeatureKind`], which decides how the slot is normalized before
//! product quantization.

pub mod extractor;
pub mod metric;
pub mod normalization;
pub mod rig;

use nalgebra::Vector3;

pub use extractor::{
    extract_pose_fragment, extract_trajectory_fragment, pose_fragment_from_transforms,
};
pub use metric::{Metric, MetricDefinition, TrajectoryMetric};
pub use normalization::{Normalization, TransformedFragment};
pub use rig::{Joint, Rig, Transform};

pub type Float3 = Vector3<f32>;

/// Directions shorter than this are replaced by [`default_direction`].
pub const MIN_DIRECTION_LENGTH: f32 = 0.02;

/// Character forward axis
pub fn default_direction() -> Float3 {
    Vector3::z()
}

/// Immutable fragment of 3D feature values.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<Float3>,
}

impl FeatureVector {
    pub fn new(values: Vec<Float3>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Float3] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Float3> {
        self.values.get(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    /// Normalized into `[-1, 1]` by a per-slot bounding box
    Position,
    /// Unit direction
    Direction,
    /// Magnitude quantized to one byte plus a unit direction
    Vector,
}

/// Kind of every slot in a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentLayout {
    kinds: Vec<FeatureKind>,
}

impl FragmentLayout {
    pub fn new(kinds: Vec<FeatureKind>) -> Self {
        Self { kinds }
    }

    /// `[Position, Vector]` per joint.
    pub fn pose(num_joints: usize) -> Self {
        Self::new(
            (0..num_joints)
                .flat_map(|_| [FeatureKind::Position, FeatureKind::Vector])
                .collect(),
        )
    }

    /// `[Vector, Direction]` per trajectory sample.
    pub fn trajectory(num_samples: usize) -> Self {
        Self::new(
            (0..num_samples)
                .flat_map(|_| [FeatureKind::Vector, FeatureKind::Direction])
                .collect(),
        )
    }

    pub fn kinds(&self) -> &[FeatureKind] {
        &self.kinds
    }

    pub fn num_features(&self) -> usize {
        self.kinds.len()
    }

    /// Flat float dimension of a transformed fragment
    pub fn dimension(&self) -> usize {
        3 * self.kinds.len()
    }

    pub fn num_quantizers(&self) -> usize {
        self.kinds
            .iter()
            .filter(|kind| **kind == FeatureKind::Vector)
            .count()
    }

    pub fn num_bounding_boxes(&self) -> usize {
        self.kinds
            .iter()
            .filter(|kind| **kind == FeatureKind::Position)
            .count()
    }
}
