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

//! Scalar range encoders used for feature normalization
//!
//! [`Quantizer`] maps a vector magnitude onto a single byte using the min/max
//! observed over all fragments of a codebook. [`BoundingBox`] maps positions into
//! `[-1, 1]` per axis before they are product-quantized.

use serde::{Deserialize, Serialize};

const MAX_CODE: f32 = 255.0;

/// One-byte min-max encoder for non-negative lengths.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Quantizer {
    pub minimum: f32,
    /// Always `>= 0`
    pub range: f32,
}

impl Quantizer {
    pub fn new(minimum: f32, range: f32) -> Self {
        Self {
            minimum,
            range: if range.is_finite() { range.max(0.0) } else { 0.0 },
        }
    }

    /// Quantizer covering `[min, max]`; inverted bounds give a zero range.
    pub fn compute(min: f32, max: f32) -> Self {
        Self::new(min, max - min)
    }

    /// Quantizer covering every value of `values`. Empty input gives the zero quantizer.
    pub fn from_values<I: IntoIterator<Item = f32>>(values: I) -> Self {
        let (min, max) = values
            .into_iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        if min > max {
            Self::default()
        } else {
            Self::compute(min, max)
        }
    }

    pub fn encode(&self, length: f32) -> u8 {
        if self.range <= 0.0 {
            return 0;
        }
        let normalized = ((length - self.minimum) / self.range).clamp(0.0, 1.0);
        (normalized * MAX_CODE).round() as u8
    }

    pub fn decode(&self, code: u8) -> f32 {
        self.minimum + (code as f32 / MAX_CODE) * self.range
    }

    /// Position of `length` within the range, clamped to `[0, 1]`.
    #[inline]
    pub fn normalize(&self, length: f32) -> f32 {
        if self.range <= 0.0 {
            0.0
        } else {
            ((length - self.minimum) / self.range).clamp(0.0, 1.0)
        }
    }

    /// Difference of two lengths on the normalized scale. A degenerate range
    /// compares the raw lengths, clamped to `[-1, 1]`.
    #[inline]
    pub fn normalized_difference(&self, a: f32, b: f32) -> f32 {
        if self.range <= 0.0 {
            (a - b).clamp(-1.0, 1.0)
        } else {
            self.normalize(a) - self.normalize(b)
        }
    }
}

/// Axis-aligned bounds of one position feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingBox {
    pub fn empty() -> Self {
        Self {
            min: [f32::INFINITY; 3],
            max: [f32::NEG_INFINITY; 3],
        }
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.min[axis] > self.max[axis])
    }

    pub fn extend(&mut self, point: [f32; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
    }

    pub fn from_points<I: IntoIterator<Item = [f32; 3]>>(points: I) -> Self {
        let mut bounds = Self::empty();
        for point in points {
            bounds.extend(point);
        }
        bounds
    }

    /// Maps `point` into `[-1, 1]` per axis; a degenerate axis maps to 0.
    pub fn normalize(&self, point: [f32; 3]) -> [f32; 3] {
        let mut out = [0.0; 3];
        for axis in 0..3 {
            let extent = self.max[axis] - self.min[axis];
            out[axis] = if extent > 0.0 {
                (2.0 * (point[axis] - self.min[axis]) / extent - 1.0).clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }
        out
    }
}
