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

//! Pose and trajectory fragment extraction
//!
//! Everything is expressed in the frame of the root transform at the sampled time.
//! The builder and the runtime both go through these functions so that stored and
//! query fragments are computed identically.

use nalgebra::Point3;

use crate::core::error::QueryError;
use crate::core::types::{EndOfSegmentPolicy, MetricIndex, SamplingTime};
use crate::features::rig::{forward, position, Rig, Transform};
use crate::features::{FeatureVector, Float3};
use crate::storage::Binary;

/// Joint positions and velocities of the metric's joints at `time`.
///
/// Velocities look one frame ahead, following segment links; at the end of an
/// unlinked segment they fall back to a backward difference.
pub fn extract_pose_fragment(
    binary: &Binary,
    metric: MetricIndex,
    time: SamplingTime,
) -> Result<FeatureVector, QueryError> {
    let resolved = binary.metric(metric).ok_or(QueryError::IndexOutOfRange {
        kind: "metric",
        index: metric.0,
    })?;
    let pose = binary.sample_pose(time)?;
    let step = 1.0 / binary.sample_rate();

    let ahead = binary.advance(time, step, EndOfSegmentPolicy::FollowLink);
    if ahead != time {
        let next = binary.sample_pose(ahead)?;
        return pose_fragment_from_transforms(binary.rig(), &resolved.joints, &pose, &next, step);
    }

    let behind = binary.advance(time, -step, EndOfSegmentPolicy::FollowLink);
    if behind == time {
        return pose_fragment_from_transforms(binary.rig(), &resolved.joints, &pose, &pose, step);
    }
    let previous = binary.sample_pose(behind)?;
    pose_fragment_from_transforms(binary.rig(), &resolved.joints, &pose, &previous, -step)
}

/// Pose fragment from two local poses `delta_time` seconds apart.
///
/// `reference` is the pose at `t + delta_time`; a negative `delta_time` means it
/// precedes `pose`. Both are local transforms with the root in world space.
pub fn pose_fragment_from_transforms(
    rig: &Rig,
    joints: &[usize],
    pose: &[Transform],
    reference: &[Transform],
    delta_time: f32,
) -> Result<FeatureVector, QueryError> {
    for sample in [pose, reference] {
        if sample.len() != rig.num_joints() {
            return Err(QueryError::PoseSizeMismatch {
                expected: rig.num_joints(),
                actual: sample.len(),
            });
        }
    }

    let character = rig.character_space(pose);
    let reference_character = rig.character_space(reference);
    let root_delta = pose[0].inverse() * reference[0];

    let mut values = Vec::with_capacity(joints.len() * 2);
    for &joint in joints {
        let current = position(&character[joint]);
        let moved = root_delta
            .transform_point(&Point3::from(position(&reference_character[joint])))
            .coords;
        let velocity = if delta_time != 0.0 {
            (moved - current) / delta_time
        } else {
            Float3::zeros()
        };
        values.push(current);
        values.push(velocity);
    }
    Ok(FeatureVector::new(values))
}

/// Root displacement and facing at each of the metric's trajectory offsets.
pub fn extract_trajectory_fragment(
    binary: &Binary,
    metric: MetricIndex,
    time: SamplingTime,
) -> Result<FeatureVector, QueryError> {
    let resolved = binary.metric(metric).ok_or(QueryError::IndexOutOfRange {
        kind: "metric",
        index: metric.0,
    })?;
    let inverse = binary.root_transform(time)?.inverse();
    let policy = binary.extraction_policy();

    let offsets = resolved.definition.trajectory.offsets();
    let mut samples = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let sample_time = binary.advance(time, offset, policy);
        let relative = inverse * binary.root_transform(sample_time)?;
        samples.push((relative.translation.vector, forward(&relative)));
    }
    Ok(trajectory_fragment_from_samples(&samples))
}

/// Interleaves `(displacement, facing)` samples into the trajectory layout.
pub fn trajectory_fragment_from_samples(samples: &[(Float3, Float3)]) -> FeatureVector {
    FeatureVector::new(
        samples
            .iter()
            .flat_map(|(displacement, facing)| [*displacement, *facing])
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::rig::Joint;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

    fn rig() -> Rig {
        Rig::new(vec![
            Joint { name: "Root".to_string(), parent: None },
            Joint { name: "Hand".to_string(), parent: Some(0) },
        ])
        .unwrap()
    }

    #[test]
    fn test_velocity_in_root_frame() {
        let rig = rig();
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f32::consts::FRAC_PI_2);
        // Root faces +X after the yaw and moves 0.1 along world +X in one step
        let pose = vec![
            Isometry3::from_parts(Translation3::new(0.0, 0.0, 0.0), yaw),
            Isometry3::translation(0.0, 1.0, 0.0),
        ];
        let next = vec![
            Isometry3::from_parts(Translation3::new(0.1, 0.0, 0.0), yaw),
            Isometry3::translation(0.0, 1.0, 0.0),
        ];

        let fragment = pose_fragment_from_transforms(&rig, &[1], &pose, &next, 0.1).unwrap();
        let velocity = fragment.values()[1];
        assert_relative_eq!(velocity.z, 1.0, epsilon = 1.0e-5);
        assert_relative_eq!(velocity.x, 0.0, epsilon = 1.0e-5);

        let backward = pose_fragment_from_transforms(&rig, &[1], &next, &pose, -0.1).unwrap();
        assert_relative_eq!(backward.values()[1].z, 1.0, epsilon = 1.0e-5);
    }

    #[test]
    fn test_pose_size_mismatch() {
        let rig = rig();
        let pose = vec![Isometry3::identity()];
        assert!(matches!(
            pose_fragment_from_transforms(&rig, &[1], &pose, &pose, 0.1),
            Err(QueryError::PoseSizeMismatch { expected: 2, actual: 1 })
        ));
    }
}
