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

//! Fragment normalization shared by the builder and the runtime query path
//!
//! Position slots are mapped through their bounding box, vector slots are split into
//! a magnitude (scored through the slot's quantizer range) and a unit direction, and
//! direction slots are normalized. Near-zero directions fall back to the forward axis.

use crate::compute::distance::squared_euclidean;
use crate::compute::quantization::{BoundingBox, Quantizer};
use crate::features::{default_direction, FeatureKind, FeatureVector, Float3, FragmentLayout};
use crate::features::MIN_DIRECTION_LENGTH;

/// Normalization parameters of one fragment set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalization {
    /// One per `Position` slot, in slot order
    pub bounding_boxes: Vec<BoundingBox>,
    /// One per `Vector` slot, in slot order
    pub quantizers: Vec<Quantizer>,
}

/// Statistics of a single slot over all fragments of a set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SlotStatistics {
    Bounds(BoundingBox),
    Magnitude(Quantizer),
    Unit,
}

/// A fragment after normalization: `3 * numFeatures` floats plus one magnitude per quantizer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedFragment {
    pub values: Vec<f32>,
    pub magnitudes: Vec<f32>,
}

pub fn unit_or_default(vector: &Float3) -> Float3 {
    let length = vector.norm();
    if length < MIN_DIRECTION_LENGTH || !length.is_finite() {
        default_direction()
    } else {
        vector / length
    }
}

impl SlotStatistics {
    /// Gathers statistics of `slot` over `fragments`.
    pub fn compute(kind: FeatureKind, fragments: &[FeatureVector], slot: usize) -> Self {
        let values = fragments.iter().filter_map(move |f| f.get(slot));
        match kind {
            FeatureKind::Position => {
                SlotStatistics::Bounds(BoundingBox::from_points(values.map(|v| [v.x, v.y, v.z])))
            }
            FeatureKind::Vector => SlotStatistics::Magnitude(Quantizer::from_values(values.map(|v| v.norm()))),
            FeatureKind::Direction => SlotStatistics::Unit,
        }
    }
}

impl Normalization {
    pub fn compute(layout: &FragmentLayout, fragments: &[FeatureVector]) -> Self {
        let statistics = layout
            .kinds()
            .iter()
            .enumerate()
            .map(|(slot, &kind)| SlotStatistics::compute(kind, fragments, slot))
            .collect();
        Self::from_statistics(statistics)
    }

    /// Assembles per-slot statistics given in slot order.
    pub fn from_statistics(statistics: Vec<SlotStatistics>) -> Self {
        let mut normalization = Self::default();
        for entry in statistics {
            match entry {
                SlotStatistics::Bounds(bounds) => normalization.bounding_boxes.push(bounds),
                SlotStatistics::Magnitude(quantizer) => normalization.quantizers.push(quantizer),
                SlotStatistics::Unit => {}
            }
        }
        normalization
    }

    pub fn transform(&self, layout: &FragmentLayout, fragment: &FeatureVector) -> TransformedFragment {
        let mut values = vec![0.0; layout.dimension()];
        let mut magnitudes = vec![0.0; layout.num_quantizers()];
        self.transform_into(layout, fragment, &mut values, &mut magnitudes);
        TransformedFragment { values, magnitudes }
    }

    /// Writes the transformed fragment into caller-provided buffers.
    pub fn transform_into(
        &self,
        layout: &FragmentLayout,
        fragment: &FeatureVector,
        values: &mut [f32],
        magnitudes: &mut [f32],
    ) {
        let mut bounds = self.bounding_boxes.iter();
        let mut magnitude_slots = magnitudes.iter_mut();

        for ((kind, value), out) in layout
            .kinds()
            .iter()
            .zip(fragment.values())
            .zip(values.chunks_exact_mut(3))
        {
            let normalized: Float3 = match kind {
                FeatureKind::Position => {
                    let mapped = bounds
                        .next()
                        .map(|b| b.normalize([value.x, value.y, value.z]))
                        .unwrap_or([0.0; 3]);
                    Float3::new(mapped[0], mapped[1], mapped[2])
                }
                FeatureKind::Vector => {
                    if let Some(slot) = magnitude_slots.next() {
                        *slot = value.norm();
                    }
                    unit_or_default(value)
                }
                FeatureKind::Direction => unit_or_default(value),
            };
            out.copy_from_slice(normalized.as_slice());
        }
    }

    /// Exact deviation between two transformed fragments.
    pub fn deviation(&self, a: &TransformedFragment, b: &TransformedFragment) -> f32 {
        let magnitude: f32 = self
            .quantizers
            .iter()
            .zip(a.magnitudes.iter().zip(&b.magnitudes))
            .map(|(q, (x, y))| {
                let d = q.normalized_difference(*x, *y);
                d * d
            })
            .sum();
        squared_euclidean(&a.values, &b.values) + magnitude
    }
}
