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

//! Immutable motion database binary
//!
//! A [`Binary`] owns (or memory-maps) one blob and exposes bounds-checked typed
//! accessors over its tables. The whole blob is validated on load: header,
//! checksum, section bounds, record sizes and every cross-table reference, so
//! accessors never see inconsistent data.

pub mod codebook;
pub mod layout;
pub mod records;
pub mod time_index;
pub mod writer;

use memmap2::{Mmap, MmapOptions};
use std::ops::Deref;
use std::path::Path;
use tracing::info;

use crate::compute::product_quantizer::{ProductQuantizer, MAX_CENTROIDS};
use crate::compute::quantization::{BoundingBox, Quantizer};
use crate::core::error::DataIntegrityError;
use crate::core::registry::{type_hash, TraitType};
use crate::core::types::{
    CodeBookIndex, EndOfSegmentPolicy, IntervalIndex, MarkerIndex, MetricIndex, SamplingTime,
    SegmentIndex, TagIndex, TagListIndex, TimeIndex, TraitIndex, TypeIndex,
};
use crate::features::rig::{Joint, Rig, Transform};
use crate::features::{FragmentLayout, Metric, Normalization};

pub use codebook::{CodeBook, CodeBookContents, FragmentSet, FragmentSetContents, FragmentSetKind};
pub use layout::{Section, FORMAT_VERSION, MAGIC};
pub use records::{Interval, Marker, Segment, Tag, TraitRecord, TypeRecord};
pub use writer::{BinaryContents, TraitContents};

use layout::{ArenaRef, ByteReader, Header, Record, CHECKSUM_SIZE, HEADER_SIZE};
use records::{BlobRecord, CodeBookRecord, FragmentSetRecord, JointRecord, TransformRecord};

type Result<T> = std::result::Result<T, DataIntegrityError>;

enum BlobBytes {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for BlobBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BlobBytes::Owned(bytes) => bytes,
            BlobBytes::Mapped(mmap) => mmap,
        }
    }
}

/// Typed, bounds-checked view over a blob with a parsed header.
#[derive(Clone, Copy)]
struct BlobView<'a> {
    data: &'a [u8],
    header: &'a Header,
}

impl<'a> BlobView<'a> {
    fn count(&self, section: Section) -> usize {
        self.header.section(section).count as usize
    }

    fn arena(&self) -> &'a [u8] {
        &self.data[self.header.section(Section::Arena).range()]
    }

    fn record<R: Record>(&self, section: Section, index: i32) -> Option<R> {
        let index = usize::try_from(index).ok()?;
        let entry = self.header.section(section);
        if index >= entry.count as usize {
            return None;
        }
        let start = entry.offset as usize + index * R::SIZE;
        let bytes = self.data.get(start..start + R::SIZE)?;
        R::read(&mut ByteReader::new(bytes)).ok()
    }

    fn require<R: Record>(&self, section: Section, index: i32) -> Result<R> {
        self.record(section, index)
            .ok_or(DataIntegrityError::InvalidReference {
                what: section.name(),
                index: index as i64,
            })
    }
}

/// Loaded motion database.
pub struct Binary {
    bytes: BlobBytes,
    header: Header,
    rig: Rig,
    metrics: Vec<Metric>,
    codebooks: Vec<CodeBook>,
}

impl std::fmt::Debug for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binary")
            .field("bytes", &self.bytes.len())
            .field("sample_rate", &self.header.sample_rate)
            .field("segments", &self.num_segments())
            .field("codebooks", &self.codebooks.len())
            .finish()
    }
}

impl Binary {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::load(BlobBytes::Owned(bytes))
    }

    /// Memory-maps and validates a binary file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        // The mapping is read-only and validated before use.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let binary = Self::load(BlobBytes::Mapped(mmap))?;
        info!(
            "📂 Opened motion database {}: {} segments, {} codebooks",
            path.as_ref().display(),
            binary.num_segments(),
            binary.codebooks.len()
        );
        Ok(binary)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn view(&self) -> BlobView<'_> {
        BlobView {
            data: &self.bytes,
            header: &self.header,
        }
    }

    fn load(bytes: BlobBytes) -> Result<Self> {
        let data: &[u8] = &bytes;
        if data.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(DataIntegrityError::Truncated {
                needed: HEADER_SIZE + CHECKSUM_SIZE,
                available: data.len(),
            });
        }

        let header = Header::read(&mut ByteReader::new(data))?;

        let body_len = data.len() - CHECKSUM_SIZE;
        let stored = ByteReader::new(&data[body_len..]).u32()?;
        let computed = crc32fast::hash(&data[..body_len]);
        if stored != computed {
            return Err(DataIntegrityError::ChecksumMismatch { stored, computed });
        }

        validate_sections(&header, body_len)?;
        if !(header.sample_rate.is_finite() && header.sample_rate > 0.0) {
            return Err(DataIntegrityError::Payload(format!(
                "invalid sample rate {}",
                header.sample_rate
            )));
        }

        let view = BlobView {
            data,
            header: &header,
        };
        let rig = load_rig(&view)?;
        let expected_transforms = header.num_frames as usize * header.num_joints as usize;
        if view.count(Section::Transforms) != expected_transforms {
            return Err(DataIntegrityError::Payload(format!(
                "expected {} transforms, found {}",
                expected_transforms,
                view.count(Section::Transforms)
            )));
        }

        validate_tables(&view)?;
        let metrics = load_metrics(&view, rig.num_joints())?;
        let codebooks = load_codebooks(&view, &metrics)?;

        Ok(Self {
            bytes,
            header,
            rig,
            metrics,
            codebooks,
        })
    }

    pub fn sample_rate(&self) -> f32 {
        self.header.sample_rate
    }

    /// Policy used for trajectory samples when the binary was built.
    pub fn extraction_policy(&self) -> EndOfSegmentPolicy {
        self.header.extraction_policy
    }

    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    pub fn num_frames(&self) -> usize {
        self.header.num_frames as usize
    }

    pub fn num_segments(&self) -> usize {
        self.view().count(Section::Segments)
    }

    pub fn segment(&self, index: SegmentIndex) -> Option<Segment> {
        self.view().record(Section::Segments, index.0)
    }

    pub fn segment_name(&self, index: SegmentIndex) -> Option<&str> {
        let segment = self.segment(index)?;
        segment.name.resolve_str(self.view().arena(), "segment name").ok()
    }

    pub fn find_segment(&self, name: &str) -> SegmentIndex {
        (0..self.num_segments())
            .map(SegmentIndex::new)
            .find(|&index| self.segment_name(index) == Some(name))
            .unwrap_or(SegmentIndex::INVALID)
    }

    pub fn num_intervals(&self) -> usize {
        self.view().count(Section::Intervals)
    }

    pub fn interval(&self, index: IntervalIndex) -> Option<Interval> {
        self.view().record(Section::Intervals, index.0)
    }

    pub fn num_codebooks(&self) -> usize {
        self.codebooks.len()
    }

    pub fn codebooks(&self) -> &[CodeBook] {
        &self.codebooks
    }

    pub fn codebook(&self, index: CodeBookIndex) -> Option<&CodeBook> {
        self.codebooks.get(index.get()?)
    }

    pub fn num_tags(&self) -> usize {
        self.view().count(Section::Tags)
    }

    pub fn tag(&self, index: TagIndex) -> Option<Tag> {
        self.view().record(Section::Tags, index.0)
    }

    pub fn num_markers(&self) -> usize {
        self.view().count(Section::Markers)
    }

    pub fn marker(&self, index: MarkerIndex) -> Option<Marker> {
        self.view().record(Section::Markers, index.0)
    }

    pub fn num_traits(&self) -> usize {
        self.view().count(Section::Traits)
    }

    pub fn trait_record(&self, index: TraitIndex) -> Option<TraitRecord> {
        self.view().record(Section::Traits, index.0)
    }

    pub fn trait_payload_bytes(&self, index: TraitIndex) -> Option<&[u8]> {
        let record = self.trait_record(index)?;
        record.payload.resolve(self.view().arena(), "trait payload").ok()
    }

    /// Decodes a trait payload as `T`; `None` when the trait has a different type.
    pub fn trait_payload<T: TraitType>(&self, index: TraitIndex) -> Option<T> {
        let record = self.trait_record(index)?;
        if self.type_record(record.type_index)?.hash != T::type_hash() {
            return None;
        }
        bincode::deserialize(self.trait_payload_bytes(index)?).ok()
    }

    pub fn num_types(&self) -> usize {
        self.view().count(Section::Types)
    }

    pub fn type_record(&self, index: TypeIndex) -> Option<TypeRecord> {
        self.view().record(Section::Types, index.0)
    }

    pub fn type_name(&self, index: TypeIndex) -> Option<&str> {
        let record = self.type_record(index)?;
        record.name.resolve_str(self.view().arena(), "type name").ok()
    }

    pub fn find_type<T: TraitType>(&self) -> TypeIndex {
        self.find_type_by_hash(T::type_hash())
    }

    pub fn find_type_by_name(&self, name: &str) -> TypeIndex {
        self.find_type_by_hash(type_hash(name))
    }

    fn find_type_by_hash(&self, hash: u32) -> TypeIndex {
        (0..self.num_types())
            .map(TypeIndex::new)
            .find(|&index| self.type_record(index).map(|t| t.hash) == Some(hash))
            .unwrap_or(TypeIndex::INVALID)
    }

    /// First marker of `type_index` within `segment`.
    pub fn find_marker(&self, segment: SegmentIndex, type_index: TypeIndex) -> MarkerIndex {
        let Some(record) = self.segment(segment) else {
            return MarkerIndex::INVALID;
        };
        if record.num_markers == 0 || !type_index.is_valid() {
            return MarkerIndex::INVALID;
        }
        let start = record.marker_index.0;
        (start..start + record.num_markers as i32)
            .map(MarkerIndex)
            .find(|&index| {
                self.marker(index)
                    .and_then(|marker| self.trait_record(marker.trait_index))
                    .map(|t| t.type_index == type_index)
                    .unwrap_or(false)
            })
            .unwrap_or(MarkerIndex::INVALID)
    }

    pub fn num_tag_lists(&self) -> usize {
        self.view().count(Section::TagLists)
    }

    pub fn tag_list(&self, index: TagListIndex) -> Option<Vec<TraitIndex>> {
        let view = self.view();
        let BlobRecord(reference) = view.record(Section::TagLists, index.0)?;
        let indices = reference.resolve_i32s(view.arena(), "tag list").ok()?;
        Some(indices.into_iter().map(TraitIndex).collect())
    }

    pub fn tag_list_has_type(&self, index: TagListIndex, type_index: TypeIndex) -> bool {
        self.tag_list(index)
            .map(|traits| {
                traits.into_iter().any(|t| {
                    self.trait_record(t)
                        .map(|record| record.type_index == type_index)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn metric(&self, index: MetricIndex) -> Option<&Metric> {
        self.metrics.get(index.get()?)
    }

    pub fn find_metric(&self, name: &str) -> MetricIndex {
        self.metrics
            .iter()
            .position(|metric| metric.name() == name)
            .map(MetricIndex::new)
            .unwrap_or(MetricIndex::INVALID)
    }

    /// `numFragments x M` centroid codes of a fragment set, borrowed from the blob.
    pub fn fragment_codes(&self, index: CodeBookIndex, kind: FragmentSetKind) -> &[u8] {
        self.codebook(index)
            .and_then(|codebook| {
                codebook
                    .fragment_set(kind)
                    .codes
                    .resolve(self.view().arena(), "codes")
                    .ok()
            })
            .unwrap_or(&[])
    }

    /// `numFragments x numQuantizers` magnitude codes, borrowed from the blob.
    pub fn magnitude_codes(&self, index: CodeBookIndex, kind: FragmentSetKind) -> &[u8] {
        self.codebook(index)
            .and_then(|codebook| {
                codebook
                    .fragment_set(kind)
                    .magnitude_codes
                    .resolve(self.view().arena(), "magnitude codes")
                    .ok()
            })
            .unwrap_or(&[])
    }

    /// Sampling time of the `fragment`-th fragment of a codebook.
    pub fn time_index_of_fragment(&self, index: CodeBookIndex, fragment: usize) -> SamplingTime {
        let Some(codebook) = self.codebook(index) else {
            return SamplingTime::INVALID;
        };
        let mut remaining = fragment;
        for interval_index in codebook.interval_range() {
            let Some(interval) = self.interval(IntervalIndex::new(interval_index)) else {
                break;
            };
            let frames = interval.num_frames as usize;
            if remaining < frames {
                return SamplingTime::new(
                    TimeIndex::new(interval.segment, (interval.first_frame as usize + remaining) as i32),
                    0.0,
                );
            }
            remaining -= frames;
        }
        SamplingTime::INVALID
    }

    /// Local transform of `joint` at a global frame.
    pub fn transform(&self, global_frame: usize, joint: usize) -> Option<Transform> {
        if joint >= self.rig.num_joints() {
            return None;
        }
        let index = global_frame
            .checked_mul(self.rig.num_joints())?
            .checked_add(joint)?;
        let index = i32::try_from(index).ok()?;
        self.view()
            .record::<TransformRecord>(Section::Transforms, index)
            .map(|record| record.0)
    }
}

fn validate_sections(header: &Header, body_len: usize) -> Result<()> {
    for section in Section::ALL {
        let entry = header.section(section);
        let offset = entry.offset as usize;
        let length = entry.length as usize;
        let end = offset.checked_add(length);
        if offset < HEADER_SIZE || end.map_or(true, |end| end > body_len) {
            return Err(DataIntegrityError::SectionOutOfBounds {
                section: section.name(),
                offset,
                length,
                blob: body_len,
            });
        }

        let record_size = match section {
            Section::Joints => JointRecord::SIZE,
            Section::Segments => Segment::SIZE,
            Section::Intervals => Interval::SIZE,
            Section::Types => TypeRecord::SIZE,
            Section::Traits => TraitRecord::SIZE,
            Section::Tags => Tag::SIZE,
            Section::Markers => Marker::SIZE,
            Section::TagLists | Section::Metrics => BlobRecord::SIZE,
            Section::CodeBooks => CodeBookRecord::SIZE,
            Section::Transforms => TransformRecord::SIZE,
            Section::Arena => 1,
        };
        let count = entry.count as usize;
        if count.checked_mul(record_size) != Some(length) {
            return Err(DataIntegrityError::RecordSizeMismatch {
                section: section.name(),
                length,
                count,
                record_size,
            });
        }
    }
    Ok(())
}

fn invalid(what: &'static str, index: usize) -> DataIntegrityError {
    DataIntegrityError::InvalidReference {
        what,
        index: index as i64,
    }
}

fn load_rig(view: &BlobView<'_>) -> Result<Rig> {
    let count = view.count(Section::Joints);
    if count != view.header.num_joints as usize {
        return Err(DataIntegrityError::Payload(format!(
            "header lists {} joints, table holds {}",
            view.header.num_joints, count
        )));
    }
    let mut joints = Vec::with_capacity(count);
    for index in 0..count {
        let record: JointRecord = view.require(Section::Joints, index as i32)?;
        joints.push(Joint {
            name: record.name.resolve_str(view.arena(), "joint name")?.to_string(),
            parent: usize::try_from(record.parent).ok(),
        });
    }
    Rig::new(joints).map_err(|e| DataIntegrityError::Payload(e.to_string()))
}

/// Checks every reference between the fixed-size tables.
fn validate_tables(view: &BlobView<'_>) -> Result<()> {
    let arena = view.arena();
    let num_segments = view.count(Section::Segments);
    let num_frames = view.header.num_frames as usize;
    let num_traits = view.count(Section::Traits);
    let num_types = view.count(Section::Types);
    let num_tag_lists = view.count(Section::TagLists);
    let num_codebooks = view.count(Section::CodeBooks);

    let segment_at = |index: i32| -> Result<Segment> {
        view.require::<Segment>(Section::Segments, index)
    };
    let check_run = |what: &'static str, start: i32, len: u32, total: usize| -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        match usize::try_from(start) {
            Ok(start) if start + len as usize <= total => Ok(()),
            _ => Err(DataIntegrityError::InvalidReference { what, index: start as i64 }),
        }
    };
    let check_link = |link: SegmentIndex| -> Result<()> {
        if link == SegmentIndex::INVALID || link.get().map_or(false, |l| l < num_segments) {
            Ok(())
        } else {
            Err(invalid("segment link", link.0.max(0) as usize))
        }
    };

    for index in 0..num_segments {
        let segment = segment_at(index as i32)?;
        segment.name.resolve_str(arena, "segment name")?;
        if segment.num_frames == 0 || segment.first_frame as usize + segment.num_frames as usize > num_frames {
            return Err(invalid("segment frames", index));
        }
        check_run("segment tags", segment.tag_index.0, segment.num_tags, view.count(Section::Tags))?;
        check_run("segment markers", segment.marker_index.0, segment.num_markers, view.count(Section::Markers))?;
        check_link(segment.previous_segment)?;
        check_link(segment.next_segment)?;
    }

    for index in 0..num_types {
        let record: TypeRecord = view.require(Section::Types, index as i32)?;
        let name = record.name.resolve_str(arena, "type name")?;
        if type_hash(name) != record.hash {
            return Err(DataIntegrityError::Payload(format!(
                "type '{}' hash mismatch",
                name
            )));
        }
    }

    for index in 0..num_traits {
        let record: TraitRecord = view.require(Section::Traits, index as i32)?;
        if record.type_index.get().map_or(true, |t| t >= num_types) {
            return Err(invalid("trait type", index));
        }
        record.payload.resolve(arena, "trait payload")?;
    }

    for index in 0..view.count(Section::Tags) {
        let tag: Tag = view.require(Section::Tags, index as i32)?;
        if tag.trait_index.get().map_or(true, |t| t >= num_traits) {
            return Err(invalid("tag trait", index));
        }
        let segment = segment_at(tag.segment.0)?;
        if tag.first_frame as u64 + tag.num_frames as u64 > segment.num_frames as u64 {
            return Err(invalid("tag frames", index));
        }
    }

    for index in 0..view.count(Section::Markers) {
        let marker: Marker = view.require(Section::Markers, index as i32)?;
        if marker.trait_index.get().map_or(true, |t| t >= num_traits) {
            return Err(invalid("marker trait", index));
        }
        if marker.frame >= segment_at(marker.segment.0)?.num_frames {
            return Err(invalid("marker frame", index));
        }
    }

    for index in 0..num_tag_lists {
        let BlobRecord(reference) = view.require(Section::TagLists, index as i32)?;
        for t in reference.resolve_i32s(arena, "tag list")? {
            if usize::try_from(t).map_or(true, |t| t >= num_traits) {
                return Err(invalid("tag list trait", index));
            }
        }
    }

    for index in 0..view.count(Section::Intervals) {
        let interval: Interval = view.require(Section::Intervals, index as i32)?;
        let segment = segment_at(interval.segment.0)?;
        if interval.num_frames == 0
            || interval.first_frame as u64 + interval.num_frames as u64 > segment.num_frames as u64
        {
            return Err(invalid("interval frames", index));
        }
        if interval.tag_list.get().map_or(true, |t| t >= num_tag_lists) {
            return Err(invalid("interval tag list", index));
        }
        if interval.codebook != CodeBookIndex::INVALID
            && interval.codebook.get().map_or(true, |c| c >= num_codebooks)
        {
            return Err(invalid("interval codebook", index));
        }
    }
    Ok(())
}

fn load_metrics(view: &BlobView<'_>, num_joints: usize) -> Result<Vec<Metric>> {
    let mut metrics = Vec::with_capacity(view.count(Section::Metrics));
    for index in 0..view.count(Section::Metrics) {
        let BlobRecord(reference) = view.require(Section::Metrics, index as i32)?;
        let metric: Metric = bincode::deserialize(reference.resolve(view.arena(), "metric")?)
            .map_err(|e| DataIntegrityError::Payload(format!("metric {}: {}", index, e)))?;
        metric
            .definition
            .validate()
            .map_err(|e| DataIntegrityError::Payload(e.to_string()))?;
        if metric.joints.len() != metric.definition.joints.len()
            || metric.joints.iter().any(|&joint| joint >= num_joints)
        {
            return Err(invalid("metric joint", index));
        }
        metrics.push(metric);
    }
    Ok(metrics)
}

fn load_codebooks(view: &BlobView<'_>, metrics: &[Metric]) -> Result<Vec<CodeBook>> {
    let num_intervals = view.count(Section::Intervals);
    let mut codebooks = Vec::with_capacity(view.count(Section::CodeBooks));

    for index in 0..view.count(Section::CodeBooks) {
        let record: CodeBookRecord = view.require(Section::CodeBooks, index as i32)?;
        let metric = record
            .metric
            .get()
            .and_then(|m| metrics.get(m))
            .ok_or_else(|| invalid("codebook metric", index))?;
        if record.tag_list.get().map_or(true, |t| t >= view.count(Section::TagLists)) {
            return Err(invalid("codebook tag list", index));
        }

        let start = record.interval_start as usize;
        let end = start + record.num_intervals as usize;
        if record.num_intervals == 0 || end > num_intervals {
            return Err(invalid("codebook intervals", index));
        }
        let mut num_fragments = 0usize;
        for interval_index in start..end {
            let interval: Interval = view.require(Section::Intervals, interval_index as i32)?;
            if interval.codebook != CodeBookIndex::new(index) || interval.tag_list != record.tag_list {
                return Err(invalid("codebook interval", interval_index));
            }
            num_fragments += interval.num_frames as usize;
        }
        if num_fragments != record.num_fragments as usize {
            return Err(DataIntegrityError::Payload(format!(
                "codebook {} covers {} frames but stores {} fragments",
                index, num_fragments, record.num_fragments
            )));
        }

        let poses = load_fragment_set(view, &record.poses, metric.pose_layout(), num_fragments, index)?;
        let trajectories = load_fragment_set(
            view,
            &record.trajectories,
            metric.trajectory_layout(),
            num_fragments,
            index,
        )?;

        codebooks.push(CodeBook {
            metric: record.metric,
            tag_list: record.tag_list,
            interval_start: IntervalIndex::new(start),
            num_intervals: record.num_intervals,
            num_fragments: record.num_fragments,
            poses,
            trajectories,
        });
    }
    Ok(codebooks)
}

fn expect_length(reference: &ArenaRef, expected: usize, what: &'static str, codebook: usize) -> Result<()> {
    if reference.length as usize != expected {
        return Err(DataIntegrityError::Payload(format!(
            "codebook {} {} holds {} bytes, expected {}",
            codebook, what, reference.length, expected
        )));
    }
    Ok(())
}

fn load_fragment_set(
    view: &BlobView<'_>,
    record: &FragmentSetRecord,
    layout: FragmentLayout,
    num_fragments: usize,
    codebook: usize,
) -> Result<FragmentSet> {
    let arena = view.arena();
    let m = record.num_sub_quantizers as usize;
    let dsub = record.sub_dimension as usize;
    let ksub = record.ksub as usize;
    if record.num_features as usize != layout.num_features()
        || m * dsub != layout.dimension()
        || ksub == 0
        || ksub > MAX_CENTROIDS
    {
        return Err(DataIntegrityError::Payload(format!(
            "codebook {} fragment set shape does not match its metric",
            codebook
        )));
    }

    let num_boxes = layout.num_bounding_boxes();
    let num_quantizers = layout.num_quantizers();
    expect_length(&record.bounding_boxes, num_boxes * 6 * 4, "bounding boxes", codebook)?;
    expect_length(&record.quantizers, num_quantizers * 2 * 4, "quantizers", codebook)?;
    expect_length(&record.centroids, m * ksub * dsub * 4, "centroids", codebook)?;
    expect_length(&record.codes, num_fragments * m, "codes", codebook)?;
    expect_length(&record.magnitude_codes, num_fragments * num_quantizers, "magnitude codes", codebook)?;

    let codes = record.codes.resolve(arena, "codes")?;
    if codes.iter().any(|&code| code as usize >= ksub) {
        return Err(DataIntegrityError::Payload(format!(
            "codebook {} has codes beyond {} centroids",
            codebook, ksub
        )));
    }
    record.magnitude_codes.resolve(arena, "magnitude codes")?;

    let bounding_boxes = record
        .bounding_boxes
        .resolve_f32s(arena, "bounding boxes")?
        .chunks_exact(6)
        .map(|b| BoundingBox {
            min: [b[0], b[1], b[2]],
            max: [b[3], b[4], b[5]],
        })
        .collect();
    let quantizers = record
        .quantizers
        .resolve_f32s(arena, "quantizers")?
        .chunks_exact(2)
        .map(|q| Quantizer::new(q[0], q[1]))
        .collect();
    let centroids = record.centroids.resolve_f32s(arena, "centroids")?;
    let quantizer = ProductQuantizer::from_parts(m, dsub, ksub, centroids)
        .map_err(|e| DataIntegrityError::Payload(e.to_string()))?;

    Ok(FragmentSet {
        layout,
        normalization: Normalization {
            bounding_boxes,
            quantizers,
        },
        quantizer,
        codes: record.codes,
        magnitude_codes: record.magnitude_codes,
    })
}
