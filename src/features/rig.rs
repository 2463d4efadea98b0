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

//! Skeleton hierarchy and transform helpers

use nalgebra::{Isometry3, Point3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::error::BuildError;
use crate::features::Float3;

/// Rigid transform (translation + rotation)
pub type Transform = Isometry3<f32>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joint {
    pub name: String,
    /// `None` only for the root
    #[serde(default)]
    pub parent: Option<usize>,
}

/// Joint hierarchy; joint 0 is the root and parents precede their children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rig {
    joints: Vec<Joint>,
}

impl Rig {
    pub fn new(joints: Vec<Joint>) -> Result<Self, BuildError> {
        if joints.is_empty() {
            return Err(BuildError::InvalidRig("rig has no joints".to_string()));
        }
        if joints[0].parent.is_some() {
            return Err(BuildError::InvalidRig(format!(
                "root joint '{}' must not have a parent",
                joints[0].name
            )));
        }
        for (index, joint) in joints.iter().enumerate().skip(1) {
            match joint.parent {
                Some(parent) if parent < index => {}
                _ => {
                    return Err(BuildError::InvalidRig(format!(
                        "joint '{}' must have a parent listed before it",
                        joint.name
                    )))
                }
            }
        }
        Ok(Self { joints })
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn num_joints(&self) -> usize {
        self.joints.len()
    }

    pub fn find_joint(&self, name: &str) -> Option<usize> {
        self.joints.iter().position(|joint| joint.name == name)
    }

    pub fn resolve_joints(&self, names: &[String]) -> Result<Vec<usize>, BuildError> {
        names
            .iter()
            .map(|name| {
                self.find_joint(name)
                    .ok_or_else(|| BuildError::UnresolvedJoint(name.clone()))
            })
            .collect()
    }

    /// Converts local transforms into the root's frame. The root itself maps to identity.
    pub fn character_space(&self, local: &[Transform]) -> Vec<Transform> {
        let mut result: Vec<Transform> = Vec::with_capacity(self.joints.len());
        for (index, joint) in self.joints.iter().enumerate() {
            let transform = match joint.parent {
                None => Transform::identity(),
                Some(parent) => result[parent] * local[index],
            };
            result.push(transform);
        }
        result
    }
}

pub trait InterpolateLinear {
    fn interpolate_linear(&self, other: &Self, f: f32) -> Self;
}

impl InterpolateLinear for Float3 {
    fn interpolate_linear(&self, other: &Self, f: f32) -> Self {
        self.lerp(other, f)
    }
}

impl InterpolateLinear for UnitQuaternion<f32> {
    fn interpolate_linear(&self, other: &Self, f: f32) -> Self {
        // Antipodal rotations have no unique arc; snap to the nearer end.
        self.try_slerp(other, f, 1.0e-6)
            .unwrap_or(if f < 0.5 { *self } else { *other })
    }
}

impl InterpolateLinear for Transform {
    fn interpolate_linear(&self, other: &Self, f: f32) -> Self {
        Isometry3::from_parts(
            Translation3::from(
                self.translation
                    .vector
                    .interpolate_linear(&other.translation.vector, f),
            ),
            self.rotation.interpolate_linear(&other.rotation, f),
        )
    }
}

/// Builds a transform from `[x, y, z]` and a `[x, y, z, w]` quaternion.
pub fn transform_from_parts(translation: [f32; 3], rotation: [f32; 4]) -> Transform {
    let [x, y, z, w] = rotation;
    Isometry3::from_parts(
        Translation3::new(translation[0], translation[1], translation[2]),
        UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z)),
    )
}

/// Inverse of [`transform_from_parts`].
pub fn transform_to_parts(transform: &Transform) -> ([f32; 3], [f32; 4]) {
    let t = transform.translation.vector;
    let q = transform.rotation.quaternion().coords;
    ([t.x, t.y, t.z], [q.x, q.y, q.z, q.w])
}

pub fn position(transform: &Transform) -> Float3 {
    transform.transform_point(&Point3::origin()).coords
}

pub fn forward(transform: &Transform) -> Float3 {
    transform.rotation * Vector3::z()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    fn rig() -> Rig {
        Rig::new(vec![
            Joint { name: "Root".to_string(), parent: None },
            Joint { name: "Hips".to_string(), parent: Some(0) },
            Joint { name: "Foot".to_string(), parent: Some(1) },
        ])
        .unwrap()
    }

    #[test]
    fn test_rig_validation() {
        assert!(Rig::new(vec![]).is_err());
        assert!(Rig::new(vec![Joint { name: "A".to_string(), parent: Some(0) }]).is_err());
        assert!(Rig::new(vec![
            Joint { name: "A".to_string(), parent: None },
            Joint { name: "B".to_string(), parent: Some(2) },
            Joint { name: "C".to_string(), parent: Some(0) },
        ])
        .is_err());
    }

    #[test]
    fn test_resolve_joints() {
        let rig = rig();
        assert_eq!(rig.resolve_joints(&["Foot".to_string()]).unwrap(), vec![2]);
        assert!(matches!(
            rig.resolve_joints(&["Hand".to_string()]),
            Err(BuildError::UnresolvedJoint(name)) if name == "Hand"
        ));
    }

    #[test]
    fn test_character_space_ignores_root_motion() {
        let rig = rig();
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2);
        let local = vec![
            Isometry3::from_parts(Translation3::new(5.0, 0.0, 5.0), yaw),
            Isometry3::translation(0.0, 1.0, 0.0),
            Isometry3::translation(0.0, -0.9, 0.2),
        ];
        let character = rig.character_space(&local);
        let foot = position(&character[2]);
        assert_relative_eq!(foot.x, 0.0, epsilon = 1.0e-6);
        assert_relative_eq!(foot.y, 0.1, epsilon = 1.0e-6);
        assert_relative_eq!(foot.z, 0.2, epsilon = 1.0e-6);
    }

    #[test]
    fn test_interpolate_transform() {
        let a = transform_from_parts([0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]);
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2);
        let b = Isometry3::from_parts(Translation3::new(2.0, 0.0, 0.0), yaw);
        let mid = a.interpolate_linear(&b, 0.5);
        assert_relative_eq!(mid.translation.vector.x, 1.0, epsilon = 1.0e-6);
        assert_relative_eq!(mid.rotation.angle(), FRAC_PI_2 / 2.0, epsilon = 1.0e-5);

        let (t, r) = transform_to_parts(&b);
        let back = transform_from_parts(t, r);
        assert_relative_eq!(back.rotation.angle(), b.rotation.angle(), epsilon = 1.0e-6);
    }
}
