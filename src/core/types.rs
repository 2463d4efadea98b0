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

//! Typed indices into the binary tables and transient sampling times.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i32);

        impl $name {
            pub const INVALID: Self = Self(-1);

            /// Wraps a table position; positions beyond `i32::MAX` become `INVALID`.
            pub fn new(index: usize) -> Self {
                i32::try_from(index).map(Self).unwrap_or(Self::INVALID)
            }

            pub fn is_valid(self) -> bool {
                self.0 >= 0
            }

            pub fn get(self) -> Option<usize> {
                usize::try_from(self.0).ok()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl From<usize> for $name {
            fn from(index: usize) -> Self {
                Self::new(index)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_index!(
    /// Index into the segment table
    SegmentIndex
);
define_index!(
    /// Index into the interval table
    IntervalIndex
);
define_index!(
    /// Index into the codebook table
    CodeBookIndex
);
define_index!(TagIndex);
define_index!(MarkerIndex);
define_index!(TraitIndex);
define_index!(TypeIndex);
define_index!(TagListIndex);
define_index!(MetricIndex);

/// Discrete position within a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeIndex {
    pub segment: SegmentIndex,
    /// Frame relative to the first frame of the segment
    pub frame: i32,
}

impl TimeIndex {
    pub const INVALID: Self = Self {
        segment: SegmentIndex::INVALID,
        frame: -1,
    };

    pub fn new(segment: SegmentIndex, frame: i32) -> Self {
        Self { segment, frame }
    }

    pub fn is_valid(&self) -> bool {
        self.segment.is_valid() && self.frame >= 0
    }
}

impl Default for TimeIndex {
    fn default() -> Self {
        Self::INVALID
    }
}

/// A time index plus an interpolation weight towards the following frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingTime {
    pub time_index: TimeIndex,
    /// Interpolation weight in `[0, 1)`
    pub theta: f32,
}

impl SamplingTime {
    pub const INVALID: Self = Self {
        time_index: TimeIndex::INVALID,
        theta: 0.0,
    };

    pub fn new(time_index: TimeIndex, theta: f32) -> Self {
        Self { time_index, theta }
    }

    pub fn at_frame(segment: SegmentIndex, frame: i32) -> Self {
        Self::new(TimeIndex::new(segment, frame), 0.0)
    }

    pub fn segment(&self) -> SegmentIndex {
        self.time_index.segment
    }

    pub fn frame(&self) -> i32 {
        self.time_index.frame
    }

    /// Structural validity only; range checks need the binary.
    pub fn is_valid(&self) -> bool {
        self.time_index.is_valid() && self.theta.is_finite() && (0.0..1.0).contains(&self.theta)
    }
}

impl Default for SamplingTime {
    fn default() -> Self {
        Self::INVALID
    }
}

/// What `advance` does when a sampling time runs past either end of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOfSegmentPolicy {
    /// Clamp to the first or last frame
    #[default]
    Saturate,
    /// Continue into the linked previous/next segment, saturating when unlinked
    FollowLink,
}
