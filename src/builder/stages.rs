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

//! The four build stages expressed as job graphs
//!
//! Every stage schedules jobs that write into disjoint [`Slots`], and a
//! single-threaded collect step folds the slots back into the pipeline once the
//! stage's graph has finished. Jobs only share immutable inputs through `Arc`s.

use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

use crate::builder::assembly::{Assembly, CodeBookPlan};
use crate::builder::scheduler::{JobGraph, JobHandle, Slots};
use crate::builder::BuildStage;
use crate::compute::kmeans::{KMeansConfig, KMeansTrainer};
use crate::compute::product_quantizer::{sub_dimension, sub_quantizer_seed, sub_vectors, ProductQuantizer};
use crate::core::config::BuildConfig;
use crate::core::error::{BuildError, QueryError};
use crate::core::types::{CodeBookIndex, SamplingTime};
use crate::features::normalization::SlotStatistics;
use crate::features::{
    extract_pose_fragment, extract_trajectory_fragment, FeatureVector, FragmentLayout, Normalization,
};
use crate::storage::{Binary, BinaryContents, CodeBookContents, FragmentSetContents, FragmentSetKind};

type ExtractedChunk = (Vec<FeatureVector>, Vec<FeatureVector>);
type TransformedChunk = (Vec<f32>, Vec<f32>);
type EncodedChunk = (Vec<u8>, Vec<u8>);

fn chunk_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len).step_by(size).map(|start| start..(start + size).min(len)).collect()
}

fn missing(what: &str) -> BuildError {
    BuildError::Internal(format!("{} was not produced", what))
}

fn shared<T: Clone>(value: Arc<T>) -> T {
    Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone())
}

/// Intermediate state of one fragment set while it moves through the stages.
#[derive(Debug)]
struct SetWork {
    kind: FragmentSetKind,
    layout: FragmentLayout,
    num_sub_quantizers: usize,
    ksub: usize,
    fragments: Arc<Vec<FeatureVector>>,
    normalization: Arc<Normalization>,
    values: Arc<Vec<f32>>,
    magnitudes: Arc<Vec<f32>>,
    quantizer: Option<Arc<ProductQuantizer>>,
    codes: Vec<u8>,
    magnitude_codes: Vec<u8>,
}

impl SetWork {
    fn into_contents(self) -> Result<FragmentSetContents, BuildError> {
        let quantizer = self.quantizer.ok_or_else(|| missing("product quantizer"))?;
        Ok(FragmentSetContents {
            normalization: shared(self.normalization),
            quantizer: shared(quantizer),
            codes: self.codes,
            magnitude_codes: self.magnitude_codes,
        })
    }
}

#[derive(Debug)]
struct CodeBookWork {
    plan: CodeBookPlan,
    sets: Vec<SetWork>,
}

pub(crate) struct NormalizeSlots {
    normalization: Arc<Slots<Normalization>>,
    transformed: Arc<Slots<TransformedChunk>>,
}

/// Job outputs of the stage currently running.
pub(crate) enum StageOutput {
    Extract(Vec<Arc<Slots<ExtractedChunk>>>),
    Normalize(Vec<Vec<NormalizeSlots>>),
    Train(Vec<Vec<Arc<Slots<Vec<f32>>>>>),
    Encode(Vec<Vec<Arc<Slots<EncodedChunk>>>>),
}

/// Everything a build carries between stages.
pub(crate) struct Pipeline {
    /// Tables without codebooks, used to extract fragments
    binary: Arc<Binary>,
    contents: BinaryContents,
    work: Vec<CodeBookWork>,
    kmeans: KMeansConfig,
    chunk_size: usize,
}

impl Pipeline {
    pub fn new(assembly: Assembly, config: &BuildConfig) -> Result<Self, BuildError> {
        let Assembly { contents, plans } = assembly;
        let bytes = contents.to_bytes()?;
        let binary = Binary::from_bytes(bytes)
            .map_err(|e| BuildError::Internal(format!("assembled tables failed validation: {}", e)))?;

        let mut work = Vec::with_capacity(plans.len());
        for plan in plans {
            let metric = plan
                .metric
                .get()
                .and_then(|m| contents.metrics.get(m))
                .ok_or_else(|| missing("metric"))?;
            let num_fragments = plan.times.len();
            let sets = FragmentSetKind::ALL
                .iter()
                .map(|&kind| {
                    let layout = match kind {
                        FragmentSetKind::Pose => metric.pose_layout(),
                        FragmentSetKind::Trajectory => metric.trajectory_layout(),
                    };
                    SetWork {
                        kind,
                        num_sub_quantizers: metric.definition.sub_quantizers_for(&layout),
                        ksub: metric.definition.ksub.min(num_fragments),
                        layout,
                        fragments: Arc::default(),
                        normalization: Arc::default(),
                        values: Arc::default(),
                        magnitudes: Arc::default(),
                        quantizer: None,
                        codes: Vec::new(),
                        magnitude_codes: Vec::new(),
                    }
                })
                .collect();
            work.push(CodeBookWork { plan, sets });
        }

        Ok(Self {
            binary: Arc::new(binary),
            contents,
            work,
            kmeans: KMeansConfig {
                num_attempts: config.kmeans_attempts,
                num_iterations: config.kmeans_iterations,
                seed: config.seed,
                split_epsilon: config.cluster_split_epsilon,
            },
            chunk_size: config.fragment_chunk_size,
        })
    }

    pub fn num_codebooks(&self) -> usize {
        self.work.len()
    }

    pub fn num_fragments(&self) -> usize {
        self.work.iter().map(|w| w.plan.times.len()).sum()
    }

    pub fn schedule(&self, stage: BuildStage) -> Result<(JobGraph, StageOutput), BuildError> {
        let mut graph = JobGraph::new();
        let output = match stage {
            BuildStage::Extract => StageOutput::Extract(self.schedule_extract(&mut graph)),
            BuildStage::Normalize => StageOutput::Normalize(self.schedule_normalize(&mut graph)),
            BuildStage::Train => StageOutput::Train(self.schedule_train(&mut graph)?),
            BuildStage::Encode => StageOutput::Encode(self.schedule_encode(&mut graph)),
        };
        debug!("Scheduled {} stage: {} jobs", stage.name(), graph.len());
        Ok((graph, output))
    }

    fn schedule_extract(&self, graph: &mut JobGraph) -> Vec<Arc<Slots<ExtractedChunk>>> {
        self.work
            .iter()
            .map(|work| {
                let ranges = chunk_ranges(work.plan.times.len(), self.chunk_size);
                let slots = Arc::new(Slots::new(ranges.len()));
                for (chunk, range) in ranges.into_iter().enumerate() {
                    let binary = Arc::clone(&self.binary);
                    let times = Arc::clone(&work.plan.times);
                    let slots = Arc::clone(&slots);
                    let metric = work.plan.metric;
                    graph.add(move || {
                        let extraction_error = |time: SamplingTime, error: QueryError| {
                            BuildError::Internal(format!("fragment extraction at {:?}: {}", time.time_index, error))
                        };
                        let mut poses = Vec::with_capacity(range.len());
                        let mut trajectories = Vec::with_capacity(range.len());
                        for &time in &times[range] {
                            poses.push(
                                extract_pose_fragment(&binary, metric, time)
                                    .map_err(|e| extraction_error(time, e))?,
                            );
                            trajectories.push(
                                extract_trajectory_fragment(&binary, metric, time)
                                    .map_err(|e| extraction_error(time, e))?,
                            );
                        }
                        slots.put(chunk, (poses, trajectories));
                        Ok(())
                    });
                }
                slots
            })
            .collect()
    }

    fn schedule_normalize(&self, graph: &mut JobGraph) -> Vec<Vec<NormalizeSlots>> {
        let mut outputs = Vec::with_capacity(self.work.len());
        for work in &self.work {
            let mut set_outputs = Vec::with_capacity(work.sets.len());
            for set in &work.sets {
                let statistics = Arc::new(Slots::new(set.layout.num_features()));
                let statistic_jobs: Vec<JobHandle> = set
                    .layout
                    .kinds()
                    .iter()
                    .enumerate()
                    .map(|(slot, &kind)| {
                        let fragments = Arc::clone(&set.fragments);
                        let statistics = Arc::clone(&statistics);
                        graph.add(move || {
                            statistics.put(slot, SlotStatistics::compute(kind, &fragments, slot));
                            Ok(())
                        })
                    })
                    .collect();

                let normalization = Arc::new(Slots::new(1));
                let assemble = {
                    let normalization = Arc::clone(&normalization);
                    graph.add_after(&statistic_jobs, move || {
                        let statistics = statistics.take_all().ok_or_else(|| missing("slot statistics"))?;
                        normalization.put(0, Normalization::from_statistics(statistics));
                        Ok(())
                    })
                };

                let ranges = chunk_ranges(set.fragments.len(), self.chunk_size);
                let transformed = Arc::new(Slots::new(ranges.len()));
                for (chunk, range) in ranges.into_iter().enumerate() {
                    let fragments = Arc::clone(&set.fragments);
                    let normalization = Arc::clone(&normalization);
                    let transformed = Arc::clone(&transformed);
                    let layout = set.layout.clone();
                    graph.add_after(&[assemble], move || {
                        let normalization = normalization
                            .read(0, Normalization::clone)
                            .ok_or_else(|| missing("normalization"))?;
                        let dimension = layout.dimension();
                        let num_quantizers = layout.num_quantizers();
                        let mut values = vec![0.0; range.len() * dimension];
                        let mut magnitudes = vec![0.0; range.len() * num_quantizers];
                        for (i, fragment) in fragments[range].iter().enumerate() {
                            normalization.transform_into(
                                &layout,
                                fragment,
                                &mut values[i * dimension..(i + 1) * dimension],
                                &mut magnitudes[i * num_quantizers..(i + 1) * num_quantizers],
                            );
                        }
                        transformed.put(chunk, (values, magnitudes));
                        Ok(())
                    });
                }

                set_outputs.push(NormalizeSlots {
                    normalization,
                    transformed,
                });
            }
            outputs.push(set_outputs);
        }
        outputs
    }

    fn schedule_train(&self, graph: &mut JobGraph) -> Result<Vec<Vec<Arc<Slots<Vec<f32>>>>>, BuildError> {
        let mut outputs = Vec::with_capacity(self.work.len());
        for (codebook, work) in self.work.iter().enumerate() {
            let mut set_outputs = Vec::with_capacity(work.sets.len());
            for set in &work.sets {
                let dimension = set.layout.dimension();
                let dsub = sub_dimension(dimension, set.num_sub_quantizers)?;
                let slots = Arc::new(Slots::new(set.num_sub_quantizers));
                for sub in 0..set.num_sub_quantizers {
                    let values = Arc::clone(&set.values);
                    let slots = Arc::clone(&slots);
                    let ksub = set.ksub;
                    let kind = set.kind;
                    let trainer = KMeansTrainer::new(KMeansConfig {
                        seed: sub_quantizer_seed(self.kmeans.seed, sub),
                        ..self.kmeans.clone()
                    });
                    graph.add(move || {
                        let samples = sub_vectors(&values, dimension, dsub, sub);
                        let result = trainer.train(&samples, dsub, ksub)?;
                        debug!(
                            "Codebook {} {} sub-quantizer {}: k={} error={:.6}",
                            codebook,
                            kind.name(),
                            sub,
                            ksub,
                            result.error
                        );
                        slots.put(sub, result.centroids);
                        Ok(())
                    });
                }
                set_outputs.push(slots);
            }
            outputs.push(set_outputs);
        }
        Ok(outputs)
    }

    fn schedule_encode(&self, graph: &mut JobGraph) -> Vec<Vec<Arc<Slots<EncodedChunk>>>> {
        let mut outputs = Vec::with_capacity(self.work.len());
        for work in &self.work {
            let mut set_outputs = Vec::with_capacity(work.sets.len());
            for set in &work.sets {
                let ranges = chunk_ranges(work.plan.times.len(), self.chunk_size);
                let slots = Arc::new(Slots::new(ranges.len()));
                let Some(quantizer) = set.quantizer.as_ref() else {
                    // Collect reports the missing quantizer.
                    set_outputs.push(slots);
                    continue;
                };
                for (chunk, range) in ranges.into_iter().enumerate() {
                    let quantizer = Arc::clone(quantizer);
                    let normalization = Arc::clone(&set.normalization);
                    let values = Arc::clone(&set.values);
                    let magnitudes = Arc::clone(&set.magnitudes);
                    let slots = Arc::clone(&slots);
                    let dimension = set.layout.dimension();
                    let num_quantizers = set.layout.num_quantizers();
                    graph.add(move || {
                        let m = quantizer.num_sub_quantizers();
                        let mut codes = vec![0u8; range.len() * m];
                        let mut magnitude_codes = vec![0u8; range.len() * num_quantizers];
                        for (i, fragment) in range.clone().enumerate() {
                            quantizer.encode_into(
                                &values[fragment * dimension..(fragment + 1) * dimension],
                                &mut codes[i * m..(i + 1) * m],
                            );
                            for (q, quantizer) in normalization.quantizers.iter().enumerate() {
                                magnitude_codes[i * num_quantizers + q] =
                                    quantizer.encode(magnitudes[fragment * num_quantizers + q]);
                            }
                        }
                        slots.put(chunk, (codes, magnitude_codes));
                        Ok(())
                    });
                }
                set_outputs.push(slots);
            }
            outputs.push(set_outputs);
        }
        outputs
    }

    /// Folds a finished stage's slots into the pipeline.
    pub fn collect(&mut self, output: StageOutput) -> Result<(), BuildError> {
        match output {
            StageOutput::Extract(outputs) => {
                for (work, slots) in self.work.iter_mut().zip(outputs) {
                    let chunks = slots.take_all().ok_or_else(|| missing("extracted fragments"))?;
                    let mut poses = Vec::with_capacity(work.plan.times.len());
                    let mut trajectories = Vec::with_capacity(work.plan.times.len());
                    for (chunk_poses, chunk_trajectories) in chunks {
                        poses.extend(chunk_poses);
                        trajectories.extend(chunk_trajectories);
                    }
                    for (set, fragments) in work.sets.iter_mut().zip([poses, trajectories]) {
                        set.fragments = Arc::new(fragments);
                    }
                }
            }
            StageOutput::Normalize(outputs) => {
                for (work, set_outputs) in self.work.iter_mut().zip(outputs) {
                    for (set, slots) in work.sets.iter_mut().zip(set_outputs) {
                        let normalization = slots.normalization.take(0).ok_or_else(|| missing("normalization"))?;
                        let chunks = slots.transformed.take_all().ok_or_else(|| missing("transformed fragments"))?;
                        let mut values = Vec::with_capacity(set.fragments.len() * set.layout.dimension());
                        let mut magnitudes = Vec::with_capacity(set.fragments.len() * set.layout.num_quantizers());
                        for (chunk_values, chunk_magnitudes) in chunks {
                            values.extend(chunk_values);
                            magnitudes.extend(chunk_magnitudes);
                        }
                        set.normalization = Arc::new(normalization);
                        set.values = Arc::new(values);
                        set.magnitudes = Arc::new(magnitudes);
                        // Raw fragments are only needed up to normalization.
                        let count = set.fragments.len();
                        set.fragments = Arc::new(Vec::new());
                        debug_assert_eq!(set.values.len(), count * set.layout.dimension());
                    }
                }
            }
            StageOutput::Train(outputs) => {
                for (work, set_outputs) in self.work.iter_mut().zip(outputs) {
                    for (set, slots) in work.sets.iter_mut().zip(set_outputs) {
                        let tables = slots.take_all().ok_or_else(|| missing("centroids"))?;
                        let dsub = sub_dimension(set.layout.dimension(), set.num_sub_quantizers)?;
                        let quantizer = ProductQuantizer::from_parts(
                            set.num_sub_quantizers,
                            dsub,
                            set.ksub,
                            tables.concat(),
                        )?;
                        set.quantizer = Some(Arc::new(quantizer));
                    }
                }
            }
            StageOutput::Encode(outputs) => {
                for (work, set_outputs) in self.work.iter_mut().zip(outputs) {
                    for (set, slots) in work.sets.iter_mut().zip(set_outputs) {
                        let chunks = slots.take_all().ok_or_else(|| missing("codes"))?;
                        let (codes, magnitude_codes): (Vec<Vec<u8>>, Vec<Vec<u8>>) = chunks.into_iter().unzip();
                        set.codes = codes.concat();
                        set.magnitude_codes = magnitude_codes.concat();
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes the codebooks into the tables and loads the final binary.
    pub fn finish(self) -> Result<Binary, BuildError> {
        let Pipeline {
            binary,
            mut contents,
            work,
            ..
        } = self;
        drop(binary);

        for (index, work) in work.into_iter().enumerate() {
            let codebook = CodeBookIndex::new(index);
            let plan = work.plan;
            let start = plan.interval_start.get().ok_or_else(|| missing("interval range"))?;
            let end = start + plan.num_intervals as usize;
            let intervals = contents
                .intervals
                .get_mut(start..end)
                .ok_or_else(|| missing("interval range"))?;
            for interval in intervals {
                interval.codebook = codebook;
            }

            let mut sets = work.sets.into_iter();
            let (Some(poses), Some(trajectories)) = (sets.next(), sets.next()) else {
                return Err(missing("fragment sets"));
            };
            contents.codebooks.push(CodeBookContents {
                metric: plan.metric,
                tag_list: plan.tag_list,
                interval_start: plan.interval_start,
                num_intervals: plan.num_intervals,
                num_fragments: plan.times.len() as u32,
                poses: poses.into_contents()?,
                trajectories: trajectories.into_contents()?,
            });
        }

        let bytes = contents.to_bytes()?;
        Binary::from_bytes(bytes).map_err(|e| BuildError::Internal(format!("built binary failed validation: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ranges_cover_everything() {
        assert_eq!(chunk_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(chunk_ranges(3, 0), vec![0..1, 1..2, 2..3]);
        assert!(chunk_ranges(0, 8).is_empty());
    }
}
