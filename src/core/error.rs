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

use thiserror::Error;

use crate::core::types::{CodeBookIndex, MetricIndex, SamplingTime};

#[derive(Error, Debug)]
pub enum MotionDBError {
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Data integrity error: {0}")]
    DataIntegrity(#[from] DataIntegrityError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Malformed clip '{clip}': {reason}")]
    MalformedClip { clip: String, reason: String },

    #[error("Joint '{0}' not found in rig")]
    UnresolvedJoint(String),

    #[error("Invalid rig: {0}")]
    InvalidRig(String),

    #[error("Trait type '{0}' is not registered")]
    UnknownTraitType(String),

    #[error("Invalid payload for trait type '{type_name}': {reason}")]
    InvalidPayload { type_name: String, reason: String },

    #[error("Invalid metric '{metric}': {reason}")]
    InvalidMetric { metric: String, reason: String },

    #[error("K-means training failed: {0}")]
    KMeans(String),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<BuildError>,
    },

    #[error("Build cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BuildError {
    pub fn stage(stage: &'static str, source: BuildError) -> Self {
        BuildError::Stage {
            stage,
            source: Box::new(source),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid sampling time: {0:?}")]
    InvalidSamplingTime(SamplingTime),

    #[error("{kind} index {index} out of range")]
    IndexOutOfRange { kind: &'static str, index: i32 },

    #[error("No codebook {0} in binary")]
    MissingCodeBook(CodeBookIndex),

    #[error("Metric {0} has no matching layout for the supplied sample")]
    LayoutMismatch(MetricIndex),

    #[error("Live pose has {actual} joints, rig has {expected}")]
    PoseSizeMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum DataIntegrityError {
    #[error("Blob truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Bad magic: {0:?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported format version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Section '{section}' out of bounds: offset {offset}, length {length}, blob {blob}")]
    SectionOutOfBounds {
        section: &'static str,
        offset: usize,
        length: usize,
        blob: usize,
    },

    #[error("Section '{section}' length {length} does not hold {count} records of {record_size} bytes")]
    RecordSizeMismatch {
        section: &'static str,
        length: usize,
        count: usize,
        record_size: usize,
    },

    #[error("Invalid {what} reference {index}")]
    InvalidReference { what: &'static str, index: i64 },

    #[error("Corrupt payload: {0}")]
    Payload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MotionDBError>;
