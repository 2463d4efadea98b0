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

//! Numeric building blocks for the index
//!
//! - Squared-distance kernels
//! - One-byte magnitude quantizers and position bounding boxes
//! - K-means training with empty-cluster repair
//! - Product quantization with lookup-table distances

pub mod distance;
pub mod kmeans;
pub mod product_quantizer;
pub mod quantization;

pub use kmeans::{KMeansConfig, KMeansResult, KMeansTrainer};
pub use product_quantizer::{DistanceTable, ProductQuantizer};
pub use quantization::{BoundingBox, Quantizer};
