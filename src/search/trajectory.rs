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

//! Desired trajectory prediction
//!
//! Integrates a root velocity that blends from the current towards the desired
//! velocity while the facing turns towards the desired direction. Both blends
//! follow `1 - exp(-factor * t)`, so larger factors commit faster.

use nalgebra::{UnitQuaternion, Vector3};

use crate::core::config::PredictionConfig;
use crate::features::normalization::unit_or_default;
use crate::features::rig::InterpolateLinear;
use crate::features::{default_direction, Float3};
use crate::search::query::{DesiredTrajectory, Waypoint};

/// Root-relative trajectory predictor.
#[derive(Debug, Clone)]
pub struct TrajectoryPrediction {
    config: PredictionConfig,
}

impl TrajectoryPrediction {
    pub fn new(config: PredictionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Waypoints from now to the configured horizon, in the current root frame.
    ///
    /// `current_velocity`, `desired_velocity` and `desired_facing` are expressed
    /// in that frame too; the current facing is the forward axis.
    pub fn predict(&self, current_velocity: Float3, desired_velocity: Float3, desired_facing: Float3) -> Vec<Waypoint> {
        let steps = self.config.num_steps.max(1);
        let dt = self.config.horizon_seconds / steps as f32;
        let turn = rotation_towards(&unit_or_default(&desired_facing));

        let mut position = Float3::zeros();
        let mut waypoints = Vec::with_capacity(steps);
        for step in 1..=steps {
            let t = step as f32 * dt;
            let velocity_blend = 1.0 - (-self.config.velocity_factor * t).exp();
            let velocity = current_velocity.lerp(&desired_velocity, velocity_blend);
            position += velocity * dt;

            let rotation_blend = 1.0 - (-self.config.rotation_factor * t).exp();
            let facing = UnitQuaternion::identity().interpolate_linear(&turn, rotation_blend) * default_direction();
            waypoints.push(Waypoint {
                time: t,
                position,
                facing,
            });
        }
        waypoints
    }

    pub fn desired_trajectory(
        &self,
        current_velocity: Float3,
        desired_velocity: Float3,
        desired_facing: Float3,
    ) -> DesiredTrajectory {
        DesiredTrajectory::Waypoints(self.predict(current_velocity, desired_velocity, desired_facing))
    }
}

impl Default for TrajectoryPrediction {
    fn default() -> Self {
        Self::new(PredictionConfig::default())
    }
}

/// Rotation taking the forward axis onto `facing`; a half turn about up when opposite.
fn rotation_towards(facing: &Float3) -> UnitQuaternion<f32> {
    UnitQuaternion::rotation_between(&default_direction(), facing)
        .unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f32::consts::PI))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_velocity_is_integrated() {
        let prediction = TrajectoryPrediction::default();
        let velocity = Float3::new(0.0, 0.0, 2.0);
        let waypoints = prediction.predict(velocity, velocity, default_direction());

        assert_eq!(waypoints.len(), 30);
        let last = waypoints[waypoints.len() - 1];
        assert_relative_eq!(last.time, 1.0, epsilon = 1.0e-5);
        assert_relative_eq!(last.position.z, 2.0, epsilon = 1.0e-4);
        assert_relative_eq!(last.facing.z, 1.0, epsilon = 1.0e-5);
    }

    #[test]
    fn test_blends_towards_desired() {
        let prediction = TrajectoryPrediction::new(PredictionConfig {
            velocity_factor: 50.0,
            rotation_factor: 50.0,
            horizon_seconds: 1.0,
            num_steps: 10,
        });
        let waypoints = prediction.predict(Float3::zeros(), Float3::new(1.0, 0.0, 0.0), Float3::new(1.0, 0.0, 0.0));
        let last = waypoints[9];
        assert!(last.position.x > 0.9);
        assert_relative_eq!(last.facing.x, 1.0, epsilon = 1.0e-3);

        let backwards = prediction.predict(Float3::zeros(), Float3::zeros(), Float3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(backwards[9].facing.z, -1.0, epsilon = 1.0e-3);
    }
}
