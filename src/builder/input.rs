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

//! Build inputs: sampled clips, annotations and the JSON clip library
//!
//! The builder only sees the [`SkeletonSampler`] and [`AnnotationSource`] traits.
//! [`ClipLibrary`] is the authoring format read by the command line tool; trait
//! payloads in it are plain JSON converted through the [`TypeRegistry`].

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::{BuildError, MotionDBError};
use crate::core::registry::{TraitValue, TypeRegistry};
use crate::features::rig::{transform_from_parts, Joint, Rig, Transform};

/// Source of local poses for one clip.
pub trait SkeletonSampler: Send + Sync {
    fn name(&self) -> &str;

    fn num_frames(&self) -> usize;

    /// Local transforms of every rig joint at `frame`; the root is in world space.
    fn sample_skeleton(&self, frame: usize) -> Result<Vec<Transform>, BuildError>;

    /// Clip that continues this one, if any. A clip naming itself loops.
    fn next_clip(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationRange {
    Tag { first_frame: usize, num_frames: usize },
    Marker { frame: usize },
}

/// A trait value attached to a clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub clip: String,
    pub value: TraitValue,
    pub range: AnnotationRange,
}

impl Annotation {
    pub fn tag(clip: impl Into<String>, value: TraitValue, first_frame: usize, num_frames: usize) -> Self {
        Self {
            clip: clip.into(),
            value,
            range: AnnotationRange::Tag {
                first_frame,
                num_frames,
            },
        }
    }

    pub fn marker(clip: impl Into<String>, value: TraitValue, frame: usize) -> Self {
        Self {
            clip: clip.into(),
            value,
            range: AnnotationRange::Marker { frame },
        }
    }
}

pub trait AnnotationSource {
    fn iterate_annotations(&self) -> Box<dyn Iterator<Item = Annotation> + '_>;
}

impl AnnotationSource for [Annotation] {
    fn iterate_annotations(&self) -> Box<dyn Iterator<Item = Annotation> + '_> {
        Box::new(self.iter().cloned())
    }
}

impl AnnotationSource for Vec<Annotation> {
    fn iterate_annotations(&self) -> Box<dyn Iterator<Item = Annotation> + '_> {
        self.as_slice().iterate_annotations()
    }
}

/// Clip held in memory as one local pose per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledClip {
    pub name: String,
    pub frames: Vec<Vec<Transform>>,
    pub next: Option<String>,
}

impl SampledClip {
    pub fn new(name: impl Into<String>, frames: Vec<Vec<Transform>>) -> Self {
        Self {
            name: name.into(),
            frames,
            next: None,
        }
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }
}

impl SkeletonSampler for SampledClip {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_frames(&self) -> usize {
        self.frames.len()
    }

    fn sample_skeleton(&self, frame: usize) -> Result<Vec<Transform>, BuildError> {
        self.frames
            .get(frame)
            .cloned()
            .ok_or_else(|| BuildError::MalformedClip {
                clip: self.name.clone(),
                reason: format!("frame {} of {} requested", frame, self.frames.len()),
            })
    }

    fn next_clip(&self) -> Option<&str> {
        self.next.as_deref()
    }
}

fn identity_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointTransform {
    pub translation: [f32; 3],
    /// `[x, y, z, w]`
    #[serde(default = "identity_rotation")]
    pub rotation: [f32; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDocument {
    #[serde(rename = "type")]
    pub type_name: String,
    pub first_frame: usize,
    pub num_frames: usize,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerDocument {
    #[serde(rename = "type")]
    pub type_name: String,
    pub frame: usize,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipDocument {
    pub name: String,
    #[serde(default)]
    pub next: Option<String>,
    /// One entry per frame, one transform per rig joint
    pub frames: Vec<Vec<JointTransform>>,
    #[serde(default)]
    pub tags: Vec<TagDocument>,
    #[serde(default)]
    pub markers: Vec<MarkerDocument>,
}

/// JSON authoring format: a rig plus annotated clips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipLibrary {
    pub rig: Vec<Joint>,
    pub clips: Vec<ClipDocument>,
}

impl ClipLibrary {
    pub fn from_json_str(content: &str) -> Result<Self, BuildError> {
        serde_json::from_str(content).map_err(|e| BuildError::MalformedClip {
            clip: "<library>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MotionDBError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_json_str(&content)?)
    }

    pub fn to_json_string(&self) -> Result<String, BuildError> {
        serde_json::to_string_pretty(self).map_err(|e| BuildError::Internal(e.to_string()))
    }

    pub fn rig(&self) -> Result<Rig, BuildError> {
        Rig::new(self.rig.clone())
    }

    pub fn clips(&self) -> Vec<SampledClip> {
        self.clips
            .iter()
            .map(|clip| SampledClip {
                name: clip.name.clone(),
                frames: clip
                    .frames
                    .iter()
                    .map(|frame| {
                        frame
                            .iter()
                            .map(|t| transform_from_parts(t.translation, t.rotation))
                            .collect()
                    })
                    .collect(),
                next: clip.next.clone(),
            })
            .collect()
    }

    /// Encodes every tag and marker payload through `registry`.
    pub fn annotations(&self, registry: &TypeRegistry) -> Result<Vec<Annotation>, BuildError> {
        let mut annotations = Vec::new();
        for clip in &self.clips {
            for tag in &clip.tags {
                let value = registry.encode_json(&tag.type_name, &tag.payload)?;
                annotations.push(Annotation::tag(&clip.name, value, tag.first_frame, tag.num_frames));
            }
            for marker in &clip.markers {
                let value = registry.encode_json(&marker.type_name, &marker.payload)?;
                annotations.push(Annotation::marker(&clip.name, value, marker.frame));
            }
        }
        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"{
        "rig": [
            {"name": "Root"},
            {"name": "Hips", "parent": 0}
        ],
        "clips": [
            {
                "name": "walk",
                "next": "walk",
                "frames": [
                    [{"translation": [0, 0, 0]}, {"translation": [0, 1, 0]}],
                    [{"translation": [0, 0, 0.1]}, {"translation": [0, 1, 0], "rotation": [0, 0, 0, 1]}]
                ],
                "tags": [{"type": "Locomotion", "first_frame": 0, "num_frames": 2}],
                "markers": [{"type": "Anchor", "frame": 1, "payload": {"translation": [1, 0, 0], "rotation": [0, 0, 0, 1]}}]
            }
        ]
    }"#;

    #[test]
    fn test_library_parses_with_defaults() {
        let library = ClipLibrary::from_json_str(LIBRARY).unwrap();
        let rig = library.rig().unwrap();
        assert_eq!(rig.num_joints(), 2);

        let clips = library.clips();
        assert_eq!(clips[0].num_frames(), 2);
        assert_eq!(clips[0].next_clip(), Some("walk"));
        let pose = clips[0].sample_skeleton(1).unwrap();
        assert!((pose[0].translation.vector.z - 0.1).abs() < 1.0e-6);
        assert!(clips[0].sample_skeleton(2).is_err());

        let annotations = library.annotations(&TypeRegistry::with_builtins()).unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].value.type_name, "Locomotion");
        assert_eq!(annotations[1].range, AnnotationRange::Marker { frame: 1 });
    }

    #[test]
    fn test_unknown_trait_type_is_rejected() {
        let library = ClipLibrary::from_json_str(LIBRARY).unwrap();
        assert!(matches!(
            library.annotations(&TypeRegistry::new()),
            Err(BuildError::UnknownTraitType(_))
        ));
        assert!(matches!(
            ClipLibrary::from_json_str("{\"rig\": 3}"),
            Err(BuildError::MalformedClip { .. })
        ));
    }
}
