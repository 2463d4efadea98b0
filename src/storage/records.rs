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

//! Fixed-size records of the binary tables

use crate::core::error::DataIntegrityError;
use crate::core::types::{
    CodeBookIndex, MarkerIndex, MetricIndex, SegmentIndex, TagIndex, TagListIndex, TraitIndex,
    TypeIndex,
};
use crate::features::rig::{transform_from_parts, transform_to_parts, Transform};
use crate::storage::layout::{ArenaRef, ByteReader, ByteWriter, Record};

type Result<T> = std::result::Result<T, DataIntegrityError>;

/// A contiguous run of frames taken from one source clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub(crate) name: ArenaRef,
    /// First frame in the global transform table
    pub first_frame: u32,
    pub num_frames: u32,
    pub tag_index: TagIndex,
    pub num_tags: u32,
    pub marker_index: MarkerIndex,
    pub num_markers: u32,
    pub previous_segment: SegmentIndex,
    pub next_segment: SegmentIndex,
}

impl Record for Segment {
    const SIZE: usize = 40;

    fn write(&self, out: &mut ByteWriter) {
        out.put_arena_ref(self.name);
        out.put_u32(self.first_frame);
        out.put_u32(self.num_frames);
        out.put_i32(self.tag_index.0);
        out.put_u32(self.num_tags);
        out.put_i32(self.marker_index.0);
        out.put_u32(self.num_markers);
        out.put_i32(self.previous_segment.0);
        out.put_i32(self.next_segment.0);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            name: reader.arena_ref()?,
            first_frame: reader.u32()?,
            num_frames: reader.u32()?,
            tag_index: TagIndex(reader.i32()?),
            num_tags: reader.u32()?,
            marker_index: MarkerIndex(reader.i32()?),
            num_markers: reader.u32()?,
            previous_segment: SegmentIndex(reader.i32()?),
            next_segment: SegmentIndex(reader.i32()?),
        })
    }
}

/// Maximal sub-range of a segment with a constant set of active tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub segment: SegmentIndex,
    /// Relative to the segment's first frame
    pub first_frame: u32,
    pub num_frames: u32,
    pub tag_list: TagListIndex,
    pub codebook: CodeBookIndex,
}

impl Interval {
    pub fn contains_frame(&self, frame: i32) -> bool {
        frame >= self.first_frame as i32 && frame < (self.first_frame + self.num_frames) as i32
    }
}

impl Record for Interval {
    const SIZE: usize = 20;

    fn write(&self, out: &mut ByteWriter) {
        out.put_i32(self.segment.0);
        out.put_u32(self.first_frame);
        out.put_u32(self.num_frames);
        out.put_i32(self.tag_list.0);
        out.put_i32(self.codebook.0);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            segment: SegmentIndex(reader.i32()?),
            first_frame: reader.u32()?,
            num_frames: reader.u32()?,
            tag_list: TagListIndex(reader.i32()?),
            codebook: CodeBookIndex(reader.i32()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRecord {
    pub(crate) name: ArenaRef,
    pub hash: u32,
}

impl Record for TypeRecord {
    const SIZE: usize = 12;

    fn write(&self, out: &mut ByteWriter) {
        out.put_arena_ref(self.name);
        out.put_u32(self.hash);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            name: reader.arena_ref()?,
            hash: reader.u32()?,
        })
    }
}

/// Typed payload shared by any number of tags and markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraitRecord {
    pub type_index: TypeIndex,
    pub(crate) payload: ArenaRef,
}

impl Record for TraitRecord {
    const SIZE: usize = 12;

    fn write(&self, out: &mut ByteWriter) {
        out.put_i32(self.type_index.0);
        out.put_arena_ref(self.payload);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            type_index: TypeIndex(reader.i32()?),
            payload: reader.arena_ref()?,
        })
    }
}

/// A trait applied to a frame range of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub trait_index: TraitIndex,
    pub segment: SegmentIndex,
    pub first_frame: u32,
    pub num_frames: u32,
}

impl Record for Tag {
    const SIZE: usize = 16;

    fn write(&self, out: &mut ByteWriter) {
        out.put_i32(self.trait_index.0);
        out.put_i32(self.segment.0);
        out.put_u32(self.first_frame);
        out.put_u32(self.num_frames);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            trait_index: TraitIndex(reader.i32()?),
            segment: SegmentIndex(reader.i32()?),
            first_frame: reader.u32()?,
            num_frames: reader.u32()?,
        })
    }
}

/// A trait applied to a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub trait_index: TraitIndex,
    pub segment: SegmentIndex,
    pub frame: u32,
}

impl Record for Marker {
    const SIZE: usize = 12;

    fn write(&self, out: &mut ByteWriter) {
        out.put_i32(self.trait_index.0);
        out.put_i32(self.segment.0);
        out.put_u32(self.frame);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            trait_index: TraitIndex(reader.i32()?),
            segment: SegmentIndex(reader.i32()?),
            frame: reader.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JointRecord {
    pub name: ArenaRef,
    pub parent: i32,
}

impl Record for JointRecord {
    const SIZE: usize = 12;

    fn write(&self, out: &mut ByteWriter) {
        out.put_arena_ref(self.name);
        out.put_i32(self.parent);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            name: reader.arena_ref()?,
            parent: reader.i32()?,
        })
    }
}

/// Local joint transform: translation then `[x, y, z, w]` rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TransformRecord(pub Transform);

impl Record for TransformRecord {
    const SIZE: usize = 28;

    fn write(&self, out: &mut ByteWriter) {
        let (translation, rotation) = transform_to_parts(&self.0);
        for value in translation.iter().chain(rotation.iter()) {
            out.put_f32(*value);
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let translation = [reader.f32()?, reader.f32()?, reader.f32()?];
        let rotation = [reader.f32()?, reader.f32()?, reader.f32()?, reader.f32()?];
        Ok(Self(transform_from_parts(translation, rotation)))
    }
}

/// Arena-backed variable-length entry (tag lists, metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlobRecord(pub ArenaRef);

impl Record for BlobRecord {
    const SIZE: usize = 8;

    fn write(&self, out: &mut ByteWriter) {
        out.put_arena_ref(self.0);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self(reader.arena_ref()?))
    }
}

/// Arena locations of one fragment set's quantization data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FragmentSetRecord {
    pub num_features: u32,
    pub num_sub_quantizers: u32,
    pub sub_dimension: u32,
    pub ksub: u32,
    pub bounding_boxes: ArenaRef,
    pub quantizers: ArenaRef,
    pub centroids: ArenaRef,
    pub codes: ArenaRef,
    pub magnitude_codes: ArenaRef,
}

impl FragmentSetRecord {
    const SIZE: usize = 56;

    fn write(&self, out: &mut ByteWriter) {
        out.put_u32(self.num_features);
        out.put_u32(self.num_sub_quantizers);
        out.put_u32(self.sub_dimension);
        out.put_u32(self.ksub);
        out.put_arena_ref(self.bounding_boxes);
        out.put_arena_ref(self.quantizers);
        out.put_arena_ref(self.centroids);
        out.put_arena_ref(self.codes);
        out.put_arena_ref(self.magnitude_codes);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            num_features: reader.u32()?,
            num_sub_quantizers: reader.u32()?,
            sub_dimension: reader.u32()?,
            ksub: reader.u32()?,
            bounding_boxes: reader.arena_ref()?,
            quantizers: reader.arena_ref()?,
            centroids: reader.arena_ref()?,
            codes: reader.arena_ref()?,
            magnitude_codes: reader.arena_ref()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CodeBookRecord {
    pub metric: MetricIndex,
    pub tag_list: TagListIndex,
    pub interval_start: u32,
    pub num_intervals: u32,
    pub num_fragments: u32,
    pub poses: FragmentSetRecord,
    pub trajectories: FragmentSetRecord,
}

impl Record for CodeBookRecord {
    const SIZE: usize = 20 + 2 * FragmentSetRecord::SIZE;

    fn write(&self, out: &mut ByteWriter) {
        out.put_i32(self.metric.0);
        out.put_i32(self.tag_list.0);
        out.put_u32(self.interval_start);
        out.put_u32(self.num_intervals);
        out.put_u32(self.num_fragments);
        self.poses.write(out);
        self.trajectories.write(out);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            metric: MetricIndex(reader.i32()?),
            tag_list: TagListIndex(reader.i32()?),
            interval_start: reader.u32()?,
            num_intervals: reader.u32()?,
            num_fragments: reader.u32()?,
            poses: FragmentSetRecord::read(reader)?,
            trajectories: FragmentSetRecord::read(reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<R: Record + PartialEq + std::fmt::Debug>(record: R) {
        let mut writer = ByteWriter::new();
        record.write(&mut writer);
        assert_eq!(writer.len(), R::SIZE);
        let decoded = R::read(&mut ByteReader::new(writer.as_slice())).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_sizes_match_encoding() {
        round_trip(Segment {
            name: ArenaRef { offset: 4, length: 8 },
            first_frame: 10,
            num_frames: 20,
            tag_index: TagIndex(0),
            num_tags: 2,
            marker_index: MarkerIndex::INVALID,
            num_markers: 0,
            previous_segment: SegmentIndex::INVALID,
            next_segment: SegmentIndex(1),
        });
        round_trip(Interval {
            segment: SegmentIndex(1),
            first_frame: 0,
            num_frames: 5,
            tag_list: TagListIndex(2),
            codebook: CodeBookIndex::INVALID,
        });
        round_trip(CodeBookRecord {
            metric: MetricIndex(0),
            tag_list: TagListIndex(1),
            interval_start: 3,
            num_intervals: 2,
            num_fragments: 40,
            poses: FragmentSetRecord { num_features: 6, ksub: 40, ..Default::default() },
            trajectories: FragmentSetRecord::default(),
        });
    }
}
