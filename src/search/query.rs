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

//! Query inputs and match results

use serde::{Deserialize, Serialize};

use crate::core::error::QueryError;
use crate::core::types::{CodeBookIndex, MetricIndex, SamplingTime};
use crate::features::extractor::trajectory_fragment_from_samples;
use crate::features::metric::TrajectoryMetric;
use crate::features::rig::Transform;
use crate::features::{default_direction, FeatureVector, Float3};

/// Restricts the scan to codebooks whose tag list carries every `include` type
/// and none of the `exclude` types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TagFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn include(mut self, type_name: impl Into<String>) -> Self {
        self.include.push(type_name.into());
        self
    }

    pub fn exclude(mut self, type_name: impl Into<String>) -> Self {
        self.exclude.push(type_name.into());
        self
    }
}

/// Current pose of the character.
#[derive(Debug, Clone, PartialEq)]
pub enum PoseSample {
    /// Local transforms (root in world space) now and `delta_time` seconds earlier
    Transforms {
        current: Vec<Transform>,
        previous: Vec<Transform>,
        delta_time: f32,
    },
    /// Pre-extracted pose fragment in the metric's layout
    Fragment(FeatureVector),
}

/// Root-relative sample of the desired path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    /// Seconds from now; negative for the past
    pub time: f32,
    pub position: Float3,
    pub facing: Float3,
}

impl Waypoint {
    pub fn origin() -> Self {
        Self {
            time: 0.0,
            position: Float3::zeros(),
            facing: default_direction(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DesiredTrajectory {
    /// Waypoints in the root frame, resampled to the metric's offsets
    Waypoints(Vec<Waypoint>),
    /// Pre-extracted trajectory fragment in the metric's layout
    Fragment(FeatureVector),
}

impl DesiredTrajectory {
    /// True when the waypoints reach into the past.
    pub fn covers_past(&self) -> bool {
        match self {
            DesiredTrajectory::Waypoints(points) => points.iter().any(|p| p.time < 0.0),
            DesiredTrajectory::Fragment(_) => true,
        }
    }

    /// `(displacement, facing)` at every offset of `trajectory`.
    pub fn samples(
        &self,
        trajectory: &TrajectoryMetric,
        metric: MetricIndex,
    ) -> Result<Vec<(Float3, Float3)>, QueryError> {
        match self {
            DesiredTrajectory::Waypoints(points) => Ok(resample(points, &trajectory.offsets())),
            DesiredTrajectory::Fragment(fragment) => {
                if fragment.len() != 2 * trajectory.total_samples() {
                    return Err(QueryError::LayoutMismatch(metric));
                }
                Ok(fragment
                    .values()
                    .chunks_exact(2)
                    .map(|pair| (pair[0], pair[1]))
                    .collect())
            }
        }
    }

    pub fn fragment(&self, trajectory: &TrajectoryMetric, metric: MetricIndex) -> Result<FeatureVector, QueryError> {
        Ok(trajectory_fragment_from_samples(&self.samples(trajectory, metric)?))
    }
}

/// Linear interpolation of `points` at each offset, clamped at both ends.
/// An origin waypoint is implied when none sits at time zero.
pub fn resample(points: &[Waypoint], offsets: &[f32]) -> Vec<(Float3, Float3)> {
    let mut sorted: Vec<Waypoint> = points
        .iter()
        .copied()
        .filter(|p| p.time.is_finite())
        .collect();
    if !sorted.iter().any(|p| p.time == 0.0) {
        sorted.push(Waypoint::origin());
    }
    sorted.sort_by(|a, b| a.time.total_cmp(&b.time));

    offsets
        .iter()
        .map(|&offset| {
            let after = sorted.partition_point(|p| p.time < offset);
            let sample = if after == 0 {
                sorted[0]
            } else if after == sorted.len() {
                sorted[sorted.len() - 1]
            } else {
                let (a, b) = (sorted[after - 1], sorted[after]);
                let span = b.time - a.time;
                let f = if span > 0.0 { (offset - a.time) / span } else { 0.0 };
                Waypoint {
                    time: offset,
                    position: a.position.lerp(&b.position, f),
                    facing: a.facing.lerp(&b.facing, f),
                }
            };
            (sample.position, sample.facing)
        })
        .collect()
}

/// One frame's search request.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    /// Live pose; when absent the pose is read from the binary at the current time
    pub pose: Option<PoseSample>,
    pub trajectory: DesiredTrajectory,
    pub filter: TagFilter,
    /// Restrict the scan to one metric by name
    pub metric: Option<String>,
}

impl MatchQuery {
    pub fn new(trajectory: DesiredTrajectory) -> Self {
        Self {
            pose: None,
            trajectory,
            filter: TagFilter::any(),
            metric: None,
        }
    }

    pub fn with_pose(mut self, pose: PoseSample) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn with_filter(mut self, filter: TagFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub time: SamplingTime,
    pub codebook: CodeBookIndex,
    /// Exact weighted pose and trajectory deviation
    pub deviation: f32,
    pub trajectory_deviation: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NoCandidateReason {
    UnknownMetric(String),
    UnknownFilterType(String),
    /// No codebook passes the metric and tag filters
    NoApplicableCodeBook,
    /// Applicable codebooks hold no usable fragment
    NoFragments,
    /// Best candidate does not beat the current time by the margin
    BelowMargin {
        current_deviation: f32,
        candidate_deviation: f32,
    },
    InvalidQuery(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched(Match),
    NoCandidate(NoCandidateReason),
}

impl MatchResult {
    pub fn matched(&self) -> Option<&Match> {
        match self {
            MatchResult::Matched(m) => Some(m),
            MatchResult::NoCandidate(_) => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn waypoint(time: f32, z: f32) -> Waypoint {
        Waypoint {
            time,
            position: Float3::new(0.0, 0.0, z),
            facing: default_direction(),
        }
    }

    #[test]
    fn test_resample_interpolates_and_clamps() {
        let points = vec![waypoint(1.0, 2.0), waypoint(0.5, 1.0)];
        let samples = resample(&points, &[0.25, 0.75, 2.0, -1.0]);
        assert_relative_eq!(samples[0].0.z, 0.5);
        assert_relative_eq!(samples[1].0.z, 1.5);
        assert_relative_eq!(samples[2].0.z, 2.0);
        assert_relative_eq!(samples[3].0.z, 0.0);
    }

    #[test]
    fn test_fragment_length_checked() {
        let trajectory = TrajectoryMetric::default();
        let short = DesiredTrajectory::Fragment(FeatureVector::new(vec![Float3::zeros(); 2]));
        assert!(matches!(
            short.fragment(&trajectory, MetricIndex(0)),
            Err(QueryError::LayoutMismatch(MetricIndex(0)))
        ));

        let waypoints = DesiredTrajectory::Waypoints(vec![waypoint(1.0, 1.0)]);
        assert_eq!(waypoints.fragment(&trajectory, MetricIndex(0)).unwrap().len(), 6);
        assert!(!waypoints.covers_past());
    }
}
