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

//! Metric definitions: which joints and trajectory samples make up a fragment

use serde::{Deserialize, Serialize};

use crate::compute::product_quantizer::MAX_CENTROIDS;
use crate::core::error::BuildError;
use crate::features::rig::Rig;
use crate::features::FragmentLayout;

/// Authoring-time description of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    /// Trait type names whose tagged intervals this metric indexes
    #[serde(default)]
    pub trait_types: Vec<String>,
    pub joints: Vec<String>,
    #[serde(default)]
    pub trajectory: TrajectoryMetric,
    /// Sub-quantizers per fragment set; defaults to one per feature
    #[serde(default)]
    pub num_sub_quantizers: Option<usize>,
    #[serde(default = "default_ksub")]
    pub ksub: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryMetric {
    pub num_samples: usize,
    pub future_seconds: f32,
    pub num_past_samples: usize,
    pub past_seconds: f32,
}

impl Default for TrajectoryMetric {
    fn default() -> Self {
        Self {
            num_samples: 3,
            future_seconds: 1.0,
            num_past_samples: 0,
            past_seconds: 0.0,
        }
    }
}

fn default_ksub() -> usize {
    MAX_CENTROIDS
}

impl TrajectoryMetric {
    pub fn total_samples(&self) -> usize {
        self.num_samples + self.num_past_samples
    }

    /// Sample offsets in seconds: future samples first, then past samples.
    pub fn offsets(&self) -> Vec<f32> {
        let future = (1..=self.num_samples)
            .map(|i| self.future_seconds * i as f32 / self.num_samples as f32);
        let past = (1..=self.num_past_samples)
            .map(|j| -self.past_seconds * j as f32 / self.num_past_samples as f32);
        future.chain(past).collect()
    }
}

impl MetricDefinition {
    pub fn default_locomotion() -> Self {
        Self {
            name: "locomotion".to_string(),
            trait_types: vec!["Locomotion".to_string(), "Idle".to_string()],
            joints: vec![
                "Hips".to_string(),
                "LeftFoot".to_string(),
                "RightFoot".to_string(),
            ],
            trajectory: TrajectoryMetric::default(),
            num_sub_quantizers: None,
            ksub: MAX_CENTROIDS,
        }
    }

    pub fn pose_layout(&self) -> FragmentLayout {
        FragmentLayout::pose(self.joints.len())
    }

    pub fn trajectory_layout(&self) -> FragmentLayout {
        FragmentLayout::trajectory(self.trajectory.total_samples())
    }

    pub fn sub_quantizers_for(&self, layout: &FragmentLayout) -> usize {
        self.num_sub_quantizers.unwrap_or_else(|| layout.num_features())
    }

    pub fn indexes_type(&self, type_name: &str) -> bool {
        self.trait_types.iter().any(|t| t == type_name)
    }

    /// Rejects layouts the codebook builder cannot train.
    pub fn validate(&self) -> Result<(), BuildError> {
        let fail = |reason: String| BuildError::InvalidMetric {
            metric: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(fail("metric name is empty".to_string()));
        }
        if self.joints.is_empty() {
            return Err(fail("no joints listed".to_string()));
        }
        let trajectory = &self.trajectory;
        if trajectory.num_samples == 0 || !(trajectory.future_seconds > 0.0) {
            return Err(fail("trajectory needs at least one future sample".to_string()));
        }
        if trajectory.num_past_samples > 0 && !(trajectory.past_seconds > 0.0) {
            return Err(fail("past samples require a positive past_seconds".to_string()));
        }
        if self.ksub == 0 || self.ksub > MAX_CENTROIDS {
            return Err(fail(format!("ksub {} outside 1..={}", self.ksub, MAX_CENTROIDS)));
        }
        for layout in [self.pose_layout(), self.trajectory_layout()] {
            let m = self.sub_quantizers_for(&layout);
            if m == 0 || layout.dimension() % m != 0 {
                return Err(fail(format!(
                    "dimension {} is not divisible into {} sub-quantizers",
                    layout.dimension(),
                    m
                )));
            }
        }
        Ok(())
    }
}

/// A metric resolved against a rig, as stored in the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub definition: MetricDefinition,
    /// Rig joint index of every joint in `definition.joints`
    pub joints: Vec<usize>,
}

impl Metric {
    pub fn resolve(definition: &MetricDefinition, rig: &Rig) -> Result<Self, BuildError> {
        definition.validate()?;
        let joints = rig.resolve_joints(&definition.joints)?;
        Ok(Self {
            definition: definition.clone(),
            joints,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn pose_layout(&self) -> FragmentLayout {
        self.definition.pose_layout()
    }

    pub fn trajectory_layout(&self) -> FragmentLayout {
        self.definition.trajectory_layout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_future_then_past() {
        let trajectory = TrajectoryMetric {
            num_samples: 2,
            future_seconds: 1.0,
            num_past_samples: 2,
            past_seconds: 0.5,
        };
        assert_eq!(trajectory.offsets(), vec![0.5, 1.0, -0.25, -0.5]);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let mut metric = MetricDefinition::default_locomotion();
        assert!(metric.validate().is_ok());

        metric.num_sub_quantizers = Some(4);
        assert!(matches!(metric.validate(), Err(BuildError::InvalidMetric { .. })));

        metric.num_sub_quantizers = Some(3);
        assert!(metric.validate().is_ok());

        metric.ksub = 512;
        assert!(metric.validate().is_err());

        let mut metric = MetricDefinition::default_locomotion();
        metric.joints.clear();
        assert!(metric.validate().is_err());
    }
}
