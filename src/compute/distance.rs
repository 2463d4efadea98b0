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

//! Distance kernels shared by training, encoding and search

/// Squared Euclidean distance. Slices must have equal length.
#[inline]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Nearest row of a flat `rows x dimension` table; ties go to the lowest row.
///
/// Returns `(row, squared distance)`. An empty table yields `(0, f32::INFINITY)`.
#[inline]
pub fn nearest_row(vector: &[f32], table: &[f32], dimension: usize) -> (usize, f32) {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (row, centroid) in table.chunks_exact(dimension).enumerate() {
        let distance = squared_euclidean(vector, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = row;
        }
    }
    (best, best_distance)
}
