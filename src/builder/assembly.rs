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

//! Assembly of clips and annotations into binary tables
//!
//! Samples every clip into the global transform table, links segments,
//! de-duplicates traits and tag lists, and cuts segments into maximal intervals
//! of constant tag sets. Intervals indexed by the same metric and tag list are
//! stored contiguously so each codebook covers a single run.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::builder::input::{AnnotationRange, AnnotationSource, SkeletonSampler};
use crate::core::config::BuildConfig;
use crate::core::error::BuildError;
use crate::core::registry::{TraitValue, TypeRegistry};
use crate::core::types::{
    CodeBookIndex, IntervalIndex, MarkerIndex, MetricIndex, SamplingTime, SegmentIndex, TagIndex,
    TagListIndex, TraitIndex, TypeIndex,
};
use crate::features::rig::{transform_to_parts, Rig};
use crate::features::Metric;
use crate::storage::layout::ArenaRef;
use crate::storage::records::{Interval, Marker, Segment, Tag};
use crate::storage::{BinaryContents, TraitContents};

/// Fragments to be indexed by one codebook.
#[derive(Debug, Clone)]
pub(crate) struct CodeBookPlan {
    pub metric: MetricIndex,
    pub tag_list: TagListIndex,
    pub interval_start: IntervalIndex,
    pub num_intervals: u32,
    /// Sampling time of every fragment, in interval order
    pub times: Arc<Vec<SamplingTime>>,
}

#[derive(Debug)]
pub(crate) struct Assembly {
    pub contents: BinaryContents,
    pub plans: Vec<CodeBookPlan>,
}

fn malformed(clip: &str, reason: impl Into<String>) -> BuildError {
    BuildError::MalformedClip {
        clip: clip.to_string(),
        reason: reason.into(),
    }
}

#[derive(Default)]
struct TraitTable {
    types: Vec<String>,
    type_lookup: HashMap<String, TypeIndex>,
    traits: Vec<TraitContents>,
    trait_lookup: HashMap<TraitValue, TraitIndex>,
}

impl TraitTable {
    fn intern(&mut self, registry: &TypeRegistry, value: TraitValue) -> Result<TraitIndex, BuildError> {
        if let Some(&index) = self.trait_lookup.get(&value) {
            return Ok(index);
        }
        let handler = registry
            .handler(&value.type_name)
            .ok_or_else(|| BuildError::UnknownTraitType(value.type_name.clone()))?;

        let type_index = match self.type_lookup.get(handler.name) {
            Some(&index) => index,
            None => {
                let index = TypeIndex::new(self.types.len());
                self.types.push(handler.name.to_string());
                self.type_lookup.insert(handler.name.to_string(), index);
                index
            }
        };

        let index = TraitIndex::new(self.traits.len());
        self.traits.push(TraitContents {
            type_index,
            payload: value.payload.clone(),
        });
        self.trait_lookup.insert(value, index);
        Ok(index)
    }

    fn type_name(&self, trait_index: TraitIndex) -> Option<&str> {
        let contents = self.traits.get(trait_index.get()?)?;
        self.types.get(contents.type_index.get()?).map(String::as_str)
    }
}

/// Maximal runs of constant active tags within one segment: `(first, len, traits)`.
fn cut_intervals(num_frames: u32, tags: &[Tag]) -> Vec<(u32, u32, Vec<TraitIndex>)> {
    let mut boundaries = vec![0, num_frames];
    for tag in tags {
        boundaries.push(tag.first_frame);
        boundaries.push(tag.first_frame + tag.num_frames);
    }
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut runs: Vec<(u32, u32, Vec<TraitIndex>)> = Vec::new();
    for window in boundaries.windows(2) {
        let (start, end) = (window[0], window[1]);
        let mut active: Vec<TraitIndex> = tags
            .iter()
            .filter(|tag| tag.first_frame <= start && start < tag.first_frame + tag.num_frames)
            .map(|tag| tag.trait_index)
            .collect();
        active.sort_unstable();
        active.dedup();

        match runs.last_mut() {
            Some(last) if last.2 == active => last.1 += end - start,
            _ => runs.push((start, end - start, active)),
        }
    }
    runs
}

fn sample_clips(
    rig: &Rig,
    clips: &[&dyn SkeletonSampler],
    contents: &mut BinaryContents,
) -> Result<HashMap<String, SegmentIndex>, BuildError> {
    let mut by_name = HashMap::new();
    for (index, clip) in clips.iter().enumerate() {
        let name = clip.name();
        if by_name.insert(name.to_string(), SegmentIndex::new(index)).is_some() {
            return Err(malformed(name, "duplicate clip name"));
        }
        let num_frames = clip.num_frames();
        if num_frames == 0 {
            return Err(malformed(name, "clip has no frames"));
        }

        let first_frame = contents.num_frames();
        for frame in 0..num_frames {
            let pose = clip.sample_skeleton(frame)?;
            if pose.len() != rig.num_joints() {
                return Err(malformed(
                    name,
                    format!("frame {} has {} joints, rig has {}", frame, pose.len(), rig.num_joints()),
                ));
            }
            let finite = pose.iter().all(|transform| {
                let (translation, rotation) = transform_to_parts(transform);
                translation.iter().chain(rotation.iter()).all(|v| v.is_finite())
            });
            if !finite {
                return Err(malformed(name, format!("frame {} has non-finite transforms", frame)));
            }
            contents.transforms.extend(pose);
        }

        contents.segment_names.push(name.to_string());
        contents.segments.push(Segment {
            name: ArenaRef::default(),
            first_frame: first_frame as u32,
            num_frames: num_frames as u32,
            tag_index: TagIndex::INVALID,
            num_tags: 0,
            marker_index: MarkerIndex::INVALID,
            num_markers: 0,
            previous_segment: SegmentIndex::INVALID,
            next_segment: SegmentIndex::INVALID,
        });
    }

    for (index, clip) in clips.iter().enumerate() {
        let Some(next_name) = clip.next_clip() else {
            continue;
        };
        let next = *by_name
            .get(next_name)
            .ok_or_else(|| malformed(clip.name(), format!("next clip '{}' does not exist", next_name)))?;
        contents.segments[index].next_segment = next;
        if let Some(next_index) = next.get() {
            let target = &mut contents.segments[next_index];
            if target.previous_segment == SegmentIndex::INVALID {
                target.previous_segment = SegmentIndex::new(index);
            }
        }
    }
    Ok(by_name)
}

pub(crate) fn assemble(
    config: &BuildConfig,
    registry: &TypeRegistry,
    rig: Rig,
    clips: &[&dyn SkeletonSampler],
    annotations: &dyn AnnotationSource,
) -> Result<Assembly, BuildError> {
    let metrics = config
        .metrics
        .iter()
        .map(|definition| Metric::resolve(definition, &rig))
        .collect::<Result<Vec<_>, _>>()?;

    let mut contents = BinaryContents {
        sample_rate: config.sample_rate,
        extraction_policy: config.end_of_segment,
        rig: rig.clone(),
        transforms: Vec::new(),
        segment_names: Vec::new(),
        segments: Vec::new(),
        intervals: Vec::new(),
        types: Vec::new(),
        traits: Vec::new(),
        tags: Vec::new(),
        markers: Vec::new(),
        tag_lists: Vec::new(),
        metrics,
        codebooks: Vec::new(),
    };
    let by_name = sample_clips(&rig, clips, &mut contents)?;

    let mut table = TraitTable::default();
    let mut tags = Vec::new();
    let mut markers = Vec::new();
    for annotation in annotations.iterate_annotations() {
        let segment = *by_name.get(&annotation.clip).ok_or_else(|| {
            malformed(&annotation.clip, "annotation refers to an unknown clip")
        })?;
        let num_frames = segment
            .get()
            .map(|s| contents.segments[s].num_frames)
            .unwrap_or(0) as usize;
        let trait_index = table.intern(registry, annotation.value)?;

        match annotation.range {
            AnnotationRange::Tag {
                first_frame,
                num_frames: length,
            } => {
                if length == 0 || first_frame + length > num_frames {
                    return Err(malformed(
                        &annotation.clip,
                        format!("tag [{}, {}) outside {} frames", first_frame, first_frame + length, num_frames),
                    ));
                }
                tags.push(Tag {
                    trait_index,
                    segment,
                    first_frame: first_frame as u32,
                    num_frames: length as u32,
                });
            }
            AnnotationRange::Marker { frame } => {
                if frame >= num_frames {
                    return Err(malformed(
                        &annotation.clip,
                        format!("marker at frame {} outside {} frames", frame, num_frames),
                    ));
                }
                markers.push(Marker {
                    trait_index,
                    segment,
                    frame: frame as u32,
                });
            }
        }
    }

    tags.sort_by_key(|t| (t.segment, t.first_frame, t.trait_index, t.num_frames));
    tags.dedup();
    markers.sort_by_key(|m| (m.segment, m.frame, m.trait_index));
    markers.dedup();

    let mut tag_list_lookup: HashMap<Vec<TraitIndex>, TagListIndex> = HashMap::new();
    let mut intervals = Vec::new();
    for (index, segment) in contents.segments.iter_mut().enumerate() {
        let segment_index = SegmentIndex::new(index);

        let tag_start = tags.partition_point(|t| t.segment < segment_index);
        let tag_end = tags.partition_point(|t| t.segment <= segment_index);
        if tag_end > tag_start {
            segment.tag_index = TagIndex::new(tag_start);
            segment.num_tags = (tag_end - tag_start) as u32;
        }
        let marker_start = markers.partition_point(|m| m.segment < segment_index);
        let marker_end = markers.partition_point(|m| m.segment <= segment_index);
        if marker_end > marker_start {
            segment.marker_index = MarkerIndex::new(marker_start);
            segment.num_markers = (marker_end - marker_start) as u32;
        }

        for (first_frame, num_frames, active) in cut_intervals(segment.num_frames, &tags[tag_start..tag_end]) {
            let next_index = TagListIndex::new(contents.tag_lists.len());
            let tag_list = *tag_list_lookup.entry(active.clone()).or_insert_with(|| {
                contents.tag_lists.push(active.clone());
                next_index
            });
            intervals.push(Interval {
                segment: segment_index,
                first_frame,
                num_frames,
                tag_list,
                codebook: CodeBookIndex::INVALID,
            });
        }
    }

    // First metric listing any of the interval's trait types indexes it.
    let metric_of = |interval: &Interval| -> Option<usize> {
        let traits = interval.tag_list.get().and_then(|t| contents.tag_lists.get(t))?;
        contents.metrics.iter().position(|metric| {
            traits.iter().any(|&t| {
                table
                    .type_name(t)
                    .map_or(false, |name| metric.definition.indexes_type(name))
            })
        })
    };
    let mut keyed: Vec<(Option<usize>, Interval)> =
        intervals.into_iter().map(|interval| (metric_of(&interval), interval)).collect();
    keyed.sort_by_key(|(metric, interval)| {
        (
            metric.unwrap_or(usize::MAX),
            interval.tag_list,
            interval.segment,
            interval.first_frame,
        )
    });

    let mut plans: Vec<CodeBookPlan> = Vec::new();
    let mut times: Vec<SamplingTime> = Vec::new();
    for (position, (metric, interval)) in keyed.iter().enumerate() {
        let Some(metric) = metric else {
            continue;
        };
        let metric = MetricIndex::new(*metric);
        let continues = plans
            .last()
            .map_or(false, |plan| plan.metric == metric && plan.tag_list == interval.tag_list);
        if !continues {
            if let Some(plan) = plans.last_mut() {
                plan.times = Arc::new(std::mem::take(&mut times));
            }
            plans.push(CodeBookPlan {
                metric,
                tag_list: interval.tag_list,
                interval_start: IntervalIndex::new(position),
                num_intervals: 0,
                times: Arc::new(Vec::new()),
            });
        }
        if let Some(plan) = plans.last_mut() {
            plan.num_intervals += 1;
        }
        times.extend(
            (0..interval.num_frames)
                .map(|f| SamplingTime::at_frame(interval.segment, (interval.first_frame + f) as i32)),
        );
    }
    if let Some(plan) = plans.last_mut() {
        plan.times = Arc::new(times);
    }

    contents.intervals = keyed.into_iter().map(|(_, interval)| interval).collect();
    contents.types = table.types;
    contents.traits = table.traits;
    contents.tags = tags;
    contents.markers = markers;

    for plan in &plans {
        debug!(
            "Planned codebook for metric {} / tag list {}: {} intervals, {} fragments",
            plan.metric,
            plan.tag_list,
            plan.num_intervals,
            plan.times.len()
        );
    }
    info!(
        "📦 Assembled {} segments, {} frames, {} intervals, {} codebooks to train",
        contents.segments.len(),
        contents.num_frames(),
        contents.intervals.len(),
        plans.len()
    );
    Ok(Assembly { contents, plans })
}
