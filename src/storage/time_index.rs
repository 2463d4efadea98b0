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

//! Time navigation and pose sampling over a loaded binary

use std::collections::HashMap;

use crate::core::error::QueryError;
use crate::core::types::{EndOfSegmentPolicy, SamplingTime, SegmentIndex, TimeIndex};
use crate::features::rig::{InterpolateLinear, Transform};
use crate::storage::records::Segment;
use crate::storage::Binary;

/// Positions this close to a whole frame snap onto it.
const FRAME_SNAP: f32 = 1.0e-4;

impl Binary {
    /// True when `time` addresses an existing frame of an existing segment.
    pub fn is_valid_time(&self, time: SamplingTime) -> bool {
        time.is_valid()
            && self
                .segment(time.segment())
                .map_or(false, |segment| (time.frame() as u32) < segment.num_frames)
    }

    /// Moves `time` by `delta_seconds`, resolving segment boundaries with `policy`.
    ///
    /// Returns `SamplingTime::INVALID` for an invalid input time.
    pub fn advance(
        &self,
        time: SamplingTime,
        delta_seconds: f32,
        policy: EndOfSegmentPolicy,
    ) -> SamplingTime {
        if !self.is_valid_time(time) || !delta_seconds.is_finite() {
            return SamplingTime::INVALID;
        }

        let follow = policy == EndOfSegmentPolicy::FollowLink;
        let mut index = time.segment();
        let Some(mut segment) = self.segment(index) else {
            return SamplingTime::INVALID;
        };
        let mut position = time.frame() as f32 + time.theta + delta_seconds * self.sample_rate();
        if (position - position.round()).abs() < FRAME_SNAP {
            position = position.round();
        }

        // Frames walked since entering each segment; revisiting one closes a
        // cycle and the remaining offset is reduced modulo its length.
        let mut walked = 0.0f32;
        let mut entered: HashMap<SegmentIndex, f32> = HashMap::new();
        entered.insert(index, walked);

        // Between reductions every crossing enters a new segment.
        for _ in 0..2 * self.num_segments() + 2 {
            let num_frames = segment.num_frames as f32;
            let last = segment.num_frames as i32 - 1;

            let crossed = if position < 0.0 {
                match self.linked(segment.previous_segment, follow) {
                    Some(previous) => {
                        index = segment.previous_segment;
                        walked += previous.num_frames as f32;
                        position += previous.num_frames as f32;
                        segment = previous;
                        true
                    }
                    None => return SamplingTime::at_frame(index, 0),
                }
            } else if position >= num_frames {
                match self.linked(segment.next_segment, follow) {
                    Some(next) => {
                        index = segment.next_segment;
                        walked += num_frames;
                        position -= num_frames;
                        segment = next;
                        true
                    }
                    None => return SamplingTime::at_frame(index, last),
                }
            } else {
                false
            };

            if crossed {
                if let Some(previous_visit) = entered.insert(index, walked) {
                    let cycle = walked - previous_visit;
                    if cycle > 0.0 {
                        position %= cycle;
                        if (position - position.round()).abs() < FRAME_SNAP {
                            position = position.round();
                        }
                    }
                }
                continue;
            }

            let frame = position.floor();
            let theta = position - frame;
            if frame as i32 >= last && (theta == 0.0 || self.linked(segment.next_segment, follow).is_none()) {
                return SamplingTime::at_frame(index, last);
            }
            return SamplingTime::new(TimeIndex::new(index, frame as i32), theta.min(1.0 - f32::EPSILON));
        }

        // Loaded binaries have no empty segments, so every walk ends above.
        let frame = if position < 0.0 { 0 } else { segment.num_frames as i32 - 1 };
        SamplingTime::at_frame(index, frame)
    }

    fn linked(&self, link: SegmentIndex, follow: bool) -> Option<Segment> {
        if follow {
            self.segment(link)
        } else {
            None
        }
    }

    fn checked_segment(&self, time: SamplingTime) -> Result<Segment, QueryError> {
        if !self.is_valid_time(time) {
            return Err(QueryError::InvalidSamplingTime(time));
        }
        self.segment(time.segment())
            .ok_or(QueryError::InvalidSamplingTime(time))
    }

    /// Global frame that `time` interpolates towards.
    fn following_frame(&self, segment: &Segment, frame: i32) -> usize {
        if (frame as u32) + 1 < segment.num_frames {
            return (segment.first_frame + frame as u32 + 1) as usize;
        }
        match self.segment(segment.next_segment) {
            Some(next) => next.first_frame as usize,
            None => (segment.first_frame + frame as u32) as usize,
        }
    }

    /// Interpolated local transform of one joint.
    pub fn sample_joint(&self, time: SamplingTime, joint: usize) -> Result<Transform, QueryError> {
        let segment = self.checked_segment(time)?;
        let global = (segment.first_frame + time.frame() as u32) as usize;
        let missing = || QueryError::IndexOutOfRange {
            kind: "joint",
            index: joint as i32,
        };
        let current = self.transform(global, joint).ok_or_else(missing)?;
        if time.theta <= 0.0 {
            return Ok(current);
        }
        let next = self
            .transform(self.following_frame(&segment, time.frame()), joint)
            .ok_or_else(missing)?;
        Ok(current.interpolate_linear(&next, time.theta))
    }

    pub fn root_transform(&self, time: SamplingTime) -> Result<Transform, QueryError> {
        self.sample_joint(time, 0)
    }

    /// Interpolated local pose at `time`; the root is in world space.
    pub fn sample_pose(&self, time: SamplingTime) -> Result<Vec<Transform>, QueryError> {
        let segment = self.checked_segment(time)?;
        let global = (segment.first_frame + time.frame() as u32) as usize;
        let following = self.following_frame(&segment, time.frame());

        (0..self.rig().num_joints())
            .map(|joint| {
                let current = self.transform(global, joint).ok_or(QueryError::IndexOutOfRange {
                    kind: "joint",
                    index: joint as i32,
                })?;
                if time.theta <= 0.0 {
                    return Ok(current);
                }
                let next = self.transform(following, joint).unwrap_or(current);
                Ok(current.interpolate_linear(&next, time.theta))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MarkerIndex, TagIndex};
    use crate::features::rig::{Joint, Rig};
    use crate::storage::layout::ArenaRef;
    use crate::storage::BinaryContents;
    use approx::assert_relative_eq;

    fn segment(first_frame: u32, num_frames: u32, previous: i32, next: i32) -> Segment {
        Segment {
            name: ArenaRef::default(),
            first_frame,
            num_frames,
            tag_index: TagIndex::INVALID,
            num_tags: 0,
            marker_index: MarkerIndex::INVALID,
            num_markers: 0,
            previous_segment: SegmentIndex(previous),
            next_segment: SegmentIndex(next),
        }
    }

    /// Segment 0 (10 frames) links to segment 1 (5 frames); segment 2 (4 frames) stands alone.
    /// The root translates one unit along X per global frame.
    fn linked_binary() -> Binary {
        binary_with_segments(vec![segment(0, 10, -1, 1), segment(10, 5, 0, -1), segment(15, 4, -1, -1)])
    }

    /// Segment 0 (4 frames) loops onto itself, followed by `extra` unlinked single-frame segments.
    fn looping_binary(extra: u32) -> Binary {
        let mut segments = vec![segment(0, 4, 0, 0)];
        segments.extend((0..extra).map(|i| segment(4 + i, 1, -1, -1)));
        binary_with_segments(segments)
    }

    fn binary_with_segments(segments: Vec<Segment>) -> Binary {
        let rig = Rig::new(vec![Joint { name: "Root".to_string(), parent: None }]).unwrap();
        let num_frames: u32 = segments.iter().map(|s| s.num_frames).sum();
        let contents = BinaryContents {
            sample_rate: 10.0,
            extraction_policy: EndOfSegmentPolicy::FollowLink,
            rig,
            transforms: (0..num_frames).map(|f| Transform::translation(f as f32, 0.0, 0.0)).collect(),
            segment_names: (0..segments.len()).map(|i| format!("s{}", i)).collect(),
            segments,
            intervals: Vec::new(),
            types: Vec::new(),
            traits: Vec::new(),
            tags: Vec::new(),
            markers: Vec::new(),
            tag_lists: Vec::new(),
            metrics: Vec::new(),
            codebooks: Vec::new(),
        };
        Binary::from_bytes(contents.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_advance_within_segment() {
        let binary = linked_binary();
        let start = SamplingTime::at_frame(SegmentIndex(0), 2);
        let moved = binary.advance(start, 0.35, EndOfSegmentPolicy::Saturate);
        assert_eq!(moved.time_index, TimeIndex::new(SegmentIndex(0), 5));
        assert_relative_eq!(moved.theta, 0.5, epsilon = 1.0e-4);
    }

    #[test]
    fn test_advance_follows_links() {
        let binary = linked_binary();
        let start = SamplingTime::at_frame(SegmentIndex(0), 8);

        let followed = binary.advance(start, 0.4, EndOfSegmentPolicy::FollowLink);
        assert_eq!(followed, SamplingTime::at_frame(SegmentIndex(1), 2));

        let saturated = binary.advance(start, 0.4, EndOfSegmentPolicy::Saturate);
        assert_eq!(saturated, SamplingTime::at_frame(SegmentIndex(0), 9));

        let back = binary.advance(SamplingTime::at_frame(SegmentIndex(1), 1), -0.3, EndOfSegmentPolicy::FollowLink);
        assert_eq!(back, SamplingTime::at_frame(SegmentIndex(0), 8));
    }

    #[test]
    fn test_advance_saturates_unlinked() {
        let binary = linked_binary();
        let start = SamplingTime::at_frame(SegmentIndex(2), 1);
        assert_eq!(
            binary.advance(start, 5.0, EndOfSegmentPolicy::FollowLink),
            SamplingTime::at_frame(SegmentIndex(2), 3)
        );
        assert_eq!(
            binary.advance(start, -5.0, EndOfSegmentPolicy::FollowLink),
            SamplingTime::at_frame(SegmentIndex(2), 0)
        );
        assert_eq!(
            binary.advance(SamplingTime::at_frame(SegmentIndex(7), 0), 0.1, EndOfSegmentPolicy::Saturate),
            SamplingTime::INVALID
        );
    }

    #[test]
    fn test_advance_wraps_self_linked_loop() {
        let start = SamplingTime::at_frame(SegmentIndex(0), 0);

        for extra in [0, 20] {
            let binary = looping_binary(extra);
            assert_eq!(
                binary.advance(start, 1.0, EndOfSegmentPolicy::FollowLink),
                SamplingTime::at_frame(SegmentIndex(0), 2)
            );
            assert_eq!(
                binary.advance(start, -1.0, EndOfSegmentPolicy::FollowLink),
                SamplingTime::at_frame(SegmentIndex(0), 2)
            );
            assert_eq!(
                binary.advance(start, 0.8, EndOfSegmentPolicy::FollowLink),
                SamplingTime::at_frame(SegmentIndex(0), 0)
            );

            let long = binary.advance(SamplingTime::at_frame(SegmentIndex(0), 1), 100.25, EndOfSegmentPolicy::FollowLink);
            assert_eq!(long.time_index, TimeIndex::new(SegmentIndex(0), 3));
            assert_relative_eq!(long.theta, 0.5, epsilon = 1.0e-3);

            assert_eq!(
                binary.advance(start, 1.0, EndOfSegmentPolicy::Saturate),
                SamplingTime::at_frame(SegmentIndex(0), 3)
            );
        }
    }

    #[test]
    fn test_sample_pose_interpolates_across_link() {
        let binary = linked_binary();
        let time = SamplingTime::new(TimeIndex::new(SegmentIndex(0), 9), 0.5);
        let pose = binary.sample_pose(time).unwrap();
        assert_relative_eq!(pose[0].translation.vector.x, 9.5, epsilon = 1.0e-5);

        let end = SamplingTime::at_frame(SegmentIndex(2), 3);
        assert_relative_eq!(binary.root_transform(end).unwrap().translation.vector.x, 18.0);

        assert!(matches!(
            binary.sample_pose(SamplingTime::at_frame(SegmentIndex(1), 5)),
            Err(QueryError::InvalidSamplingTime(_))
        ));
    }
}
