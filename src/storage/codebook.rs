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

//! Codebooks: product-quantized fragment sets over a run of intervals

use std::ops::Range;

use crate::compute::product_quantizer::ProductQuantizer;
use crate::core::types::{IntervalIndex, MetricIndex, TagListIndex};
use crate::features::{FragmentLayout, Normalization};
use crate::storage::layout::ArenaRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentSetKind {
    Pose,
    Trajectory,
}

impl FragmentSetKind {
    pub const ALL: [FragmentSetKind; 2] = [FragmentSetKind::Pose, FragmentSetKind::Trajectory];

    pub fn name(self) -> &'static str {
        match self {
            FragmentSetKind::Pose => "pose",
            FragmentSetKind::Trajectory => "trajectory",
        }
    }
}

/// Decoded normalization and centroids of one fragment set. The per-fragment
/// byte codes stay in the blob and are reached through [`crate::storage::Binary`].
#[derive(Debug, Clone)]
pub struct FragmentSet {
    pub layout: FragmentLayout,
    pub normalization: Normalization,
    pub quantizer: ProductQuantizer,
    pub(crate) codes: ArenaRef,
    pub(crate) magnitude_codes: ArenaRef,
}

impl FragmentSet {
    pub fn num_quantizers(&self) -> usize {
        self.normalization.quantizers.len()
    }
}

#[derive(Debug, Clone)]
pub struct CodeBook {
    pub metric: MetricIndex,
    pub tag_list: TagListIndex,
    pub interval_start: IntervalIndex,
    pub num_intervals: u32,
    pub num_fragments: u32,
    pub poses: FragmentSet,
    pub trajectories: FragmentSet,
}

impl CodeBook {
    pub fn fragment_set(&self, kind: FragmentSetKind) -> &FragmentSet {
        match kind {
            FragmentSetKind::Pose => &self.poses,
            FragmentSetKind::Trajectory => &self.trajectories,
        }
    }

    pub fn interval_range(&self) -> Range<usize> {
        let start = self.interval_start.get().unwrap_or(0);
        start..start + self.num_intervals as usize
    }
}

/// Owned quantization output of one fragment set, as produced by the builder.
#[derive(Debug, Clone)]
pub struct FragmentSetContents {
    pub normalization: Normalization,
    pub quantizer: ProductQuantizer,
    /// `numFragments x M` centroid indices
    pub codes: Vec<u8>,
    /// `numFragments x numQuantizers` magnitude codes
    pub magnitude_codes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CodeBookContents {
    pub metric: MetricIndex,
    pub tag_list: TagListIndex,
    pub interval_start: IntervalIndex,
    pub num_intervals: u32,
    pub num_fragments: u32,
    pub poses: FragmentSetContents,
    pub trajectories: FragmentSetContents,
}
