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

//! Serialization of assembled contents into a binary blob

use tracing::debug;

use crate::core::error::BuildError;
use crate::core::registry::type_hash;
use crate::core::types::{EndOfSegmentPolicy, TraitIndex, TypeIndex};
use crate::features::rig::{Rig, Transform};
use crate::features::Metric;
use crate::storage::codebook::{CodeBookContents, FragmentSetContents};
use crate::storage::layout::{
    ArenaWriter, ByteWriter, Header, Record, Section, SectionEntry, FORMAT_VERSION, HEADER_SIZE,
};
use crate::storage::records::{
    BlobRecord, CodeBookRecord, FragmentSetRecord, Interval, JointRecord, Marker, Segment, Tag,
    TraitRecord, TransformRecord, TypeRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitContents {
    pub type_index: TypeIndex,
    pub payload: Vec<u8>,
}

/// Everything that goes into a binary, in table order.
#[derive(Debug, Clone)]
pub struct BinaryContents {
    pub sample_rate: f32,
    pub extraction_policy: EndOfSegmentPolicy,
    pub rig: Rig,
    /// Frame-major local transforms: `frame * numJoints + joint`
    pub transforms: Vec<Transform>,
    pub segment_names: Vec<String>,
    pub segments: Vec<Segment>,
    pub intervals: Vec<Interval>,
    pub types: Vec<String>,
    pub traits: Vec<TraitContents>,
    pub tags: Vec<Tag>,
    pub markers: Vec<Marker>,
    pub tag_lists: Vec<Vec<TraitIndex>>,
    pub metrics: Vec<Metric>,
    pub codebooks: Vec<CodeBookContents>,
}

struct Tables {
    sections: Vec<(ByteWriter, u32)>,
}

impl Tables {
    fn new() -> Self {
        Self {
            sections: (0..Section::COUNT).map(|_| (ByteWriter::new(), 0)).collect(),
        }
    }

    fn push<R: Record>(&mut self, section: Section, record: &R) {
        let (writer, count) = &mut self.sections[section.index()];
        record.write(writer);
        *count += 1;
    }
}

fn write_fragment_set(arena: &mut ArenaWriter, set: &FragmentSetContents, num_features: usize) -> FragmentSetRecord {
    let bounds: Vec<f32> = set
        .normalization
        .bounding_boxes
        .iter()
        .flat_map(|b| b.min.into_iter().chain(b.max))
        .collect();
    let quantizers: Vec<f32> = set
        .normalization
        .quantizers
        .iter()
        .flat_map(|q| [q.minimum, q.range])
        .collect();

    FragmentSetRecord {
        num_features: num_features as u32,
        num_sub_quantizers: set.quantizer.num_sub_quantizers() as u32,
        sub_dimension: set.quantizer.sub_dimension() as u32,
        ksub: set.quantizer.ksub() as u32,
        bounding_boxes: arena.push_f32s(&bounds),
        quantizers: arena.push_f32s(&quantizers),
        centroids: arena.push_f32s(set.quantizer.all_centroids()),
        codes: arena.push_bytes(&set.codes),
        magnitude_codes: arena.push_bytes(&set.magnitude_codes),
    }
}

impl BinaryContents {
    pub fn num_frames(&self) -> usize {
        self.transforms.len() / self.rig.num_joints().max(1)
    }

    /// Encodes the contents; the result always passes [`crate::storage::Binary::from_bytes`]
    /// validation when the contents are consistent.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BuildError> {
        let mut arena = ArenaWriter::new();
        let mut tables = Tables::new();

        for joint in self.rig.joints() {
            let record = JointRecord {
                name: arena.push_str(&joint.name),
                parent: joint.parent.map(|p| p as i32).unwrap_or(-1),
            };
            tables.push(Section::Joints, &record);
        }

        for (segment, name) in self.segments.iter().zip(&self.segment_names) {
            let record = Segment {
                name: arena.push_str(name),
                ..*segment
            };
            tables.push(Section::Segments, &record);
        }

        for interval in &self.intervals {
            tables.push(Section::Intervals, interval);
        }

        for name in &self.types {
            let record = TypeRecord {
                name: arena.push_str(name),
                hash: type_hash(name),
            };
            tables.push(Section::Types, &record);
        }

        for value in &self.traits {
            let record = TraitRecord {
                type_index: value.type_index,
                payload: arena.push_bytes(&value.payload),
            };
            tables.push(Section::Traits, &record);
        }

        for tag in &self.tags {
            tables.push(Section::Tags, tag);
        }
        for marker in &self.markers {
            tables.push(Section::Markers, marker);
        }

        for list in &self.tag_lists {
            let indices: Vec<i32> = list.iter().map(|t| t.0).collect();
            tables.push(Section::TagLists, &BlobRecord(arena.push_i32s(&indices)));
        }

        for metric in &self.metrics {
            let encoded = bincode::serialize(metric).map_err(|e| {
                BuildError::Internal(format!("failed to encode metric '{}': {}", metric.name(), e))
            })?;
            tables.push(Section::Metrics, &BlobRecord(arena.push_bytes(&encoded)));
        }

        for codebook in &self.codebooks {
            let metric = codebook
                .metric
                .get()
                .and_then(|i| self.metrics.get(i))
                .ok_or_else(|| BuildError::Internal(format!("codebook metric {} missing", codebook.metric)))?;
            let record = CodeBookRecord {
                metric: codebook.metric,
                tag_list: codebook.tag_list,
                interval_start: codebook.interval_start.0.max(0) as u32,
                num_intervals: codebook.num_intervals,
                num_fragments: codebook.num_fragments,
                poses: write_fragment_set(&mut arena, &codebook.poses, metric.pose_layout().num_features()),
                trajectories: write_fragment_set(
                    &mut arena,
                    &codebook.trajectories,
                    metric.trajectory_layout().num_features(),
                ),
            };
            tables.push(Section::CodeBooks, &record);
        }

        for transform in &self.transforms {
            tables.push(Section::Transforms, &TransformRecord(*transform));
        }

        let arena = arena.into_inner();
        let (arena_writer, arena_count) = &mut tables.sections[Section::Arena.index()];
        arena_writer.put_bytes(&arena);
        *arena_count = arena.len() as u32;

        let mut sections = [SectionEntry::default(); Section::COUNT];
        let mut offset = HEADER_SIZE;
        for (entry, (writer, count)) in sections.iter_mut().zip(&tables.sections) {
            *entry = SectionEntry {
                offset: offset as u32,
                length: writer.len() as u32,
                count: *count,
            };
            offset += writer.len();
        }

        let header = Header {
            version: FORMAT_VERSION,
            sample_rate: self.sample_rate,
            num_joints: self.rig.num_joints() as u32,
            num_frames: self.num_frames() as u32,
            extraction_policy: self.extraction_policy,
            sections,
        };

        let mut out = ByteWriter::with_capacity(offset + 4);
        header.write(&mut out);
        for (writer, _) in &tables.sections {
            out.put_bytes(writer.as_slice());
        }
        let checksum = crc32fast::hash(out.as_slice());
        out.put_u32(checksum);

        if out.len() > u32::MAX as usize {
            return Err(BuildError::Internal(format!(
                "binary of {} bytes exceeds the 4 GiB addressing limit",
                out.len()
            )));
        }

        debug!(
            "💾 Encoded binary: {} bytes, {} segments, {} codebooks, checksum {:#010x}",
            out.len(),
            self.segments.len(),
            self.codebooks.len(),
            checksum
        );
        Ok(out.into_inner())
    }
}
