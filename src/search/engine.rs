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

//! Runtime matching engine
//!
//! A search runs in three passes over an immutable [`Binary`]:
//!
//! 1. **Approximate scan**: every fragment of every applicable codebook is scored
//!    from its byte codes through per-query lookup tables, keeping the best
//!    `max_approximate_candidates` in a bounded heap.
//! 2. **Exact re-rank**: the surviving candidates are re-extracted from the stored
//!    poses and scored on unquantized features.
//! 3. **Hysteresis**: the winner only replaces the playing time when its trajectory
//!    deviation beats the current one by `min_trajectory_deviation_margin`.
//!
//! Ties are broken by codebook index, then fragment index, in every pass.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tracing::{debug, trace, warn};

use crate::compute::product_quantizer::DistanceTable;
use crate::compute::quantization::Quantizer;
use crate::core::config::SearchConfig;
use crate::core::error::{ConfigError, QueryError};
use crate::core::types::{CodeBookIndex, MetricIndex, SamplingTime, TypeIndex};
use crate::features::extractor::{
    extract_pose_fragment, extract_trajectory_fragment, pose_fragment_from_transforms,
    trajectory_fragment_from_samples,
};
use crate::features::normalization::TransformedFragment;
use crate::features::FeatureVector;
use crate::search::query::{Match, MatchQuery, MatchResult, NoCandidateReason, PoseSample};
use crate::storage::{Binary, CodeBook, FragmentSet, FragmentSetKind};

/// Where a query sits in its search cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Idle,
    Searching,
    Matched,
    NoCandidate,
}

/// Playing time of one character plus the outcome of its last search.
#[derive(Debug, Clone)]
pub struct QueryState {
    time: SamplingTime,
    phase: QueryPhase,
    last_result: Option<MatchResult>,
}

impl QueryState {
    pub fn new() -> Self {
        Self::starting_at(SamplingTime::INVALID)
    }

    pub fn starting_at(time: SamplingTime) -> Self {
        Self {
            time,
            phase: QueryPhase::Idle,
            last_result: None,
        }
    }

    pub fn time(&self) -> SamplingTime {
        self.time
    }

    pub fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub fn last_result(&self) -> Option<&MatchResult> {
        self.last_result.as_ref()
    }

    /// Jumps to `time` without searching.
    pub fn play(&mut self, time: SamplingTime) {
        self.time = time;
        self.phase = QueryPhase::Idle;
    }
}

impl Default for QueryState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    cost: f32,
    codebook: CodeBookIndex,
    fragment: u32,
    /// Position of the codebook in the prepared query list
    slot: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then(self.codebook.cmp(&other.codebook))
            .then(self.fragment.cmp(&other.fragment))
    }
}

/// Max-heap holding the `limit` cheapest candidates.
struct TopCandidates {
    heap: BinaryHeap<Candidate>,
    limit: usize,
}

impl TopCandidates {
    fn new(limit: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(limit + 1),
            limit,
        }
    }

    #[inline]
    fn offer(&mut self, candidate: Candidate) {
        if self.heap.len() < self.limit {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek() {
            if candidate < *worst {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    fn merge(&mut self, other: TopCandidates) {
        for candidate in other.heap {
            self.offer(candidate);
        }
    }

    fn into_sorted(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

/// Query side of one fragment set, normalized by that set's parameters.
struct PreparedSet {
    fragment: TransformedFragment,
    table: DistanceTable,
}

impl PreparedSet {
    fn new(set: &FragmentSet, fragment: &FeatureVector) -> Self {
        let fragment = set.normalization.transform(&set.layout, fragment);
        let table = set.quantizer.distance_table(&fragment.values);
        Self { fragment, table }
    }
}

struct PreparedCodeBook<'a> {
    index: CodeBookIndex,
    codebook: &'a CodeBook,
    pose: Option<PreparedSet>,
    trajectory: PreparedSet,
}

/// Untransformed query fragments for one metric.
#[derive(Clone)]
struct QueryFragments {
    pose: Option<FeatureVector>,
    trajectory: FeatureVector,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    candidate: Candidate,
    time: SamplingTime,
    deviation: f32,
    trajectory_deviation: f32,
}

/// Searches one binary; cheap to construct, safe to share across threads.
#[derive(Debug, Clone)]
pub struct MatchingEngine<'a> {
    binary: &'a Binary,
    config: SearchConfig,
}

impl<'a> MatchingEngine<'a> {
    pub fn new(binary: &'a Binary, config: SearchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { binary, config })
    }

    pub fn binary(&self) -> &'a Binary {
        self.binary
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Moves the playing time forward using the configured end-of-segment policy.
    pub fn advance_time(&self, state: &mut QueryState, delta_seconds: f32) {
        state.time = self
            .binary
            .advance(state.time, delta_seconds, self.config.end_of_segment);
    }

    /// Searches from the state's playing time and switches it on a match.
    pub fn find_match(&self, state: &mut QueryState, query: &MatchQuery) -> MatchResult {
        state.phase = QueryPhase::Searching;
        let result = self.search(state.time, query);
        match &result {
            MatchResult::Matched(found) => {
                state.time = found.time;
                state.phase = QueryPhase::Matched;
            }
            MatchResult::NoCandidate(_) => state.phase = QueryPhase::NoCandidate,
        }
        state.last_result = Some(result.clone());
        result
    }

    /// Best fragment to play next from `current`, which may be `SamplingTime::INVALID`.
    pub fn search(&self, current: SamplingTime, query: &MatchQuery) -> MatchResult {
        let codebooks = match self.applicable_codebooks(query) {
            Ok(codebooks) => codebooks,
            Err(reason) => return MatchResult::NoCandidate(reason),
        };
        let current = if self.binary.is_valid_time(current) {
            current
        } else {
            SamplingTime::INVALID
        };

        let prepared = match self.prepare(&codebooks, current, query) {
            Ok(prepared) => prepared,
            Err(reason) => return MatchResult::NoCandidate(reason),
        };

        let candidates = self.scan(&prepared);
        trace!("Approximate scan kept {} candidates", candidates.len());

        let Some(best) = self.rerank(&prepared, candidates) else {
            return MatchResult::NoCandidate(NoCandidateReason::NoFragments);
        };
        self.apply_hysteresis(&prepared[best.candidate.slot], current, query, best)
    }

    fn applicable_codebooks(&self, query: &MatchQuery) -> Result<Vec<CodeBookIndex>, NoCandidateReason> {
        let metric = match &query.metric {
            Some(name) => {
                let index = self.binary.find_metric(name);
                if !index.is_valid() {
                    return Err(NoCandidateReason::UnknownMetric(name.clone()));
                }
                Some(index)
            }
            None => None,
        };

        let mut include = Vec::with_capacity(query.filter.include.len());
        for name in &query.filter.include {
            let index = self.binary.find_type_by_name(name);
            if !index.is_valid() {
                return Err(NoCandidateReason::UnknownFilterType(name.clone()));
            }
            include.push(index);
        }
        let exclude: Vec<TypeIndex> = query
            .filter
            .exclude
            .iter()
            .map(|name| self.binary.find_type_by_name(name))
            .filter(|index| index.is_valid())
            .collect();

        let codebooks: Vec<CodeBookIndex> = self
            .binary
            .codebooks()
            .iter()
            .enumerate()
            .filter(|(_, codebook)| metric.map_or(true, |m| codebook.metric == m))
            .filter(|(_, codebook)| {
                include
                    .iter()
                    .all(|&t| self.binary.tag_list_has_type(codebook.tag_list, t))
                    && !exclude
                        .iter()
                        .any(|&t| self.binary.tag_list_has_type(codebook.tag_list, t))
            })
            .map(|(index, _)| CodeBookIndex::new(index))
            .collect();

        if codebooks.is_empty() {
            return Err(NoCandidateReason::NoApplicableCodeBook);
        }
        Ok(codebooks)
    }

    fn prepare(
        &self,
        codebooks: &[CodeBookIndex],
        current: SamplingTime,
        query: &MatchQuery,
    ) -> Result<Vec<PreparedCodeBook<'a>>, NoCandidateReason> {
        let mut fragments: HashMap<MetricIndex, Result<QueryFragments, String>> = HashMap::new();
        let mut prepared = Vec::with_capacity(codebooks.len());
        let mut last_error = None;

        for &index in codebooks {
            let Some(codebook) = self.binary.codebook(index) else {
                continue;
            };
            if codebook.num_fragments == 0 {
                continue;
            }
            let entry = fragments
                .entry(codebook.metric)
                .or_insert_with(|| {
                    self.query_fragments(codebook.metric, current, query)
                        .map_err(|e| e.to_string())
                });
            match entry {
                Ok(query_fragments) => prepared.push(PreparedCodeBook {
                    index,
                    codebook,
                    pose: query_fragments
                        .pose
                        .as_ref()
                        .map(|pose| PreparedSet::new(&codebook.poses, pose)),
                    trajectory: PreparedSet::new(&codebook.trajectories, &query_fragments.trajectory),
                }),
                Err(error) => {
                    debug!("Skipping codebook {}: {}", index, error);
                    last_error = Some(error.clone());
                }
            }
        }

        if prepared.is_empty() {
            return Err(match last_error {
                Some(error) => NoCandidateReason::InvalidQuery(error),
                None => NoCandidateReason::NoFragments,
            });
        }
        Ok(prepared)
    }

    fn query_fragments(
        &self,
        metric_index: MetricIndex,
        current: SamplingTime,
        query: &MatchQuery,
    ) -> Result<QueryFragments, QueryError> {
        let metric = self
            .binary
            .metric(metric_index)
            .ok_or(QueryError::IndexOutOfRange {
                kind: "metric",
                index: metric_index.0,
            })?;

        let pose = match &query.pose {
            Some(PoseSample::Transforms {
                current: pose,
                previous,
                delta_time,
            }) => Some(pose_fragment_from_transforms(
                self.binary.rig(),
                &metric.joints,
                pose,
                previous,
                -*delta_time,
            )?),
            Some(PoseSample::Fragment(fragment)) => {
                if fragment.len() != metric.pose_layout().num_features() {
                    return Err(QueryError::LayoutMismatch(metric_index));
                }
                Some(fragment.clone())
            }
            None if current.is_valid() => Some(extract_pose_fragment(self.binary, metric_index, current)?),
            None => None,
        };

        let trajectory_metric = &metric.definition.trajectory;
        let mut samples = query.trajectory.samples(trajectory_metric, metric_index)?;
        if trajectory_metric.num_past_samples > 0 && !query.trajectory.covers_past() && current.is_valid() {
            // Past samples come from the motion actually played.
            let played = extract_trajectory_fragment(self.binary, metric_index, current)?;
            for (slot, sample) in samples.iter_mut().enumerate().skip(trajectory_metric.num_samples) {
                if let (Some(displacement), Some(facing)) = (played.get(2 * slot), played.get(2 * slot + 1)) {
                    *sample = (*displacement, *facing);
                }
            }
        }

        Ok(QueryFragments {
            pose,
            trajectory: trajectory_fragment_from_samples(&samples),
        })
    }

    fn scan(&self, prepared: &[PreparedCodeBook<'a>]) -> Vec<Candidate> {
        let limit = self.config.max_approximate_candidates;
        let mut top = TopCandidates::new(limit);

        if self.config.parallel_codebooks && prepared.len() > 1 {
            let scanned = crossbeam::scope(|scope| {
                let handles: Vec<_> = prepared
                    .iter()
                    .enumerate()
                    .map(|(slot, codebook)| scope.spawn(move |_| self.scan_codebook(slot, codebook, limit)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join())
                    .collect::<Result<Vec<_>, _>>()
            });
            match scanned {
                Ok(Ok(parts)) => {
                    for part in parts {
                        top.merge(part);
                    }
                    return top.into_sorted();
                }
                _ => debug!("Parallel scan failed, rescanning serially"),
            }
        }

        for (slot, codebook) in prepared.iter().enumerate() {
            top.merge(self.scan_codebook(slot, codebook, limit));
        }
        top.into_sorted()
    }

    fn scan_codebook(&self, slot: usize, prepared: &PreparedCodeBook<'a>, limit: usize) -> TopCandidates {
        let mut top = TopCandidates::new(limit);
        let codebook = prepared.codebook;
        let weight = self.config.trajectory_weight;

        let pose = prepared.pose.as_ref().map(|set| {
            SetCodes::new(self.binary, prepared.index, FragmentSetKind::Pose, &codebook.poses, set)
        });
        let trajectory = SetCodes::new(
            self.binary,
            prepared.index,
            FragmentSetKind::Trajectory,
            &codebook.trajectories,
            &prepared.trajectory,
        );

        for fragment in 0..codebook.num_fragments as usize {
            let pose_cost = pose.as_ref().map_or(0.0, |codes| codes.cost(fragment));
            let cost = (1.0 - weight) * pose_cost + weight * trajectory.cost(fragment);
            top.offer(Candidate {
                cost,
                codebook: prepared.index,
                fragment: fragment as u32,
                slot,
            });
        }
        top
    }

    fn rerank(&self, prepared: &[PreparedCodeBook<'a>], candidates: Vec<Candidate>) -> Option<Scored> {
        let weight = self.config.trajectory_weight;
        let mut best: Option<Scored> = None;

        for candidate in candidates {
            let entry = &prepared[candidate.slot];
            match self.exact_deviation(entry, candidate) {
                Ok((pose_deviation, trajectory_deviation, time)) => {
                    let deviation = (1.0 - weight) * pose_deviation + weight * trajectory_deviation;
                    let scored = Scored {
                        candidate: Candidate {
                            cost: deviation,
                            ..candidate
                        },
                        time,
                        deviation,
                        trajectory_deviation,
                    };
                    if best.map_or(true, |b| scored.candidate < b.candidate) {
                        best = Some(scored);
                    }
                }
                Err(error) => debug!(
                    "Dropping candidate {}:{} from re-rank: {}",
                    candidate.codebook, candidate.fragment, error
                ),
            }
        }
        best
    }

    /// `(pose, trajectory, time)` deviation of a candidate on unquantized features.
    fn exact_deviation(
        &self,
        prepared: &PreparedCodeBook<'a>,
        candidate: Candidate,
    ) -> Result<(f32, f32, SamplingTime), QueryError> {
        let codebook = prepared.codebook;
        let time = self
            .binary
            .time_index_of_fragment(candidate.codebook, candidate.fragment as usize);
        if !time.is_valid() {
            return Err(QueryError::InvalidSamplingTime(time));
        }

        let pose = match &prepared.pose {
            Some(query) => {
                let stored = extract_pose_fragment(self.binary, codebook.metric, time)?;
                let stored = codebook
                    .poses
                    .normalization
                    .transform(&codebook.poses.layout, &stored);
                codebook.poses.normalization.deviation(&query.fragment, &stored)
            }
            None => 0.0,
        };
        let trajectory = self.trajectory_deviation(codebook, &prepared.trajectory.fragment, time)?;
        Ok((pose, trajectory, time))
    }

    fn trajectory_deviation(
        &self,
        codebook: &CodeBook,
        query: &TransformedFragment,
        time: SamplingTime,
    ) -> Result<f32, QueryError> {
        let stored = extract_trajectory_fragment(self.binary, codebook.metric, time)?;
        let set = &codebook.trajectories;
        let stored = set.normalization.transform(&set.layout, &stored);
        Ok(set.normalization.deviation(query, &stored))
    }

    fn apply_hysteresis(
        &self,
        winner: &PreparedCodeBook<'a>,
        current: SamplingTime,
        query: &MatchQuery,
        best: Scored,
    ) -> MatchResult {
        let found = Match {
            time: best.time,
            codebook: best.candidate.codebook,
            deviation: best.deviation,
            trajectory_deviation: best.trajectory_deviation,
        };
        if !current.is_valid() {
            debug!("Matched {:?} with no current time", found.time);
            return MatchResult::Matched(found);
        }

        let current_deviation = self.trajectory_deviation(winner.codebook, &winner.trajectory.fragment, current);
        trace!("Hysteresis against {:?} (filter {:?})", current, query.filter);
        hysteresis(found, current_deviation, self.config.min_trajectory_deviation_margin)
    }
}

/// Keeps the current time unless `found` beats its trajectory deviation by more
/// than `margin`. A current time that cannot be measured fails the query.
fn hysteresis(found: Match, current_deviation: Result<f32, QueryError>, margin: f32) -> MatchResult {
    let current_deviation = match current_deviation {
        Ok(deviation) => deviation,
        Err(error) => {
            warn!("Current time not comparable to {:?}: {}", found.time, error);
            return MatchResult::NoCandidate(NoCandidateReason::InvalidQuery(error.to_string()));
        }
    };

    if found.trajectory_deviation < current_deviation - margin {
        debug!(
            "Switching to {:?}: {} < {} - {}",
            found.time, found.trajectory_deviation, current_deviation, margin
        );
        MatchResult::Matched(found)
    } else {
        MatchResult::NoCandidate(NoCandidateReason::BelowMargin {
            current_deviation,
            candidate_deviation: found.trajectory_deviation,
        })
    }
}

/// Byte codes of one fragment set plus the query's lookup table.
struct SetCodes<'q> {
    codes: &'q [u8],
    magnitude_codes: &'q [u8],
    width: usize,
    quantizers: &'q [Quantizer],
    table: &'q DistanceTable,
    magnitudes: &'q [f32],
}

impl<'q> SetCodes<'q> {
    fn new(
        binary: &'q Binary,
        index: CodeBookIndex,
        kind: FragmentSetKind,
        set: &'q FragmentSet,
        query: &'q PreparedSet,
    ) -> Self {
        Self {
            codes: binary.fragment_codes(index, kind),
            magnitude_codes: binary.magnitude_codes(index, kind),
            width: set.quantizer.num_sub_quantizers(),
            quantizers: &set.normalization.quantizers,
            table: &query.table,
            magnitudes: &query.fragment.magnitudes,
        }
    }

    /// Table distance plus range-scaled magnitude differences; `O(M)`.
    #[inline]
    fn cost(&self, fragment: usize) -> f32 {
        let codes = row(self.codes, self.width, fragment);
        let magnitude_codes = row(self.magnitude_codes, self.quantizers.len(), fragment);
        let magnitude: f32 = self
            .quantizers
            .iter()
            .zip(self.magnitudes)
            .zip(magnitude_codes)
            .map(|((quantizer, &query), &code)| {
                let d = quantizer.normalized_difference(query, quantizer.decode(code));
                d * d
            })
            .sum();
        self.table.distance(codes) + magnitude
    }
}

#[inline]
fn row(data: &[u8], width: usize, index: usize) -> &[u8] {
    data.get(index * width..(index + 1) * width).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(cost: f32, codebook: i32, fragment: u32) -> Candidate {
        Candidate {
            cost,
            codebook: CodeBookIndex(codebook),
            fragment,
            slot: 0,
        }
    }

    #[test]
    fn test_top_candidates_keeps_cheapest() {
        let mut top = TopCandidates::new(2);
        for (i, cost) in [5.0, 1.0, 3.0, 0.5].into_iter().enumerate() {
            top.offer(candidate(cost, 0, i as u32));
        }
        let kept: Vec<u32> = top.into_sorted().iter().map(|c| c.fragment).collect();
        assert_eq!(kept, vec![3, 1]);
    }

    #[test]
    fn test_ties_break_by_codebook_then_fragment() {
        let mut top = TopCandidates::new(2);
        top.offer(candidate(1.0, 1, 0));
        top.offer(candidate(1.0, 0, 7));
        top.offer(candidate(1.0, 0, 3));
        let kept: Vec<(i32, u32)> = top
            .into_sorted()
            .iter()
            .map(|c| (c.codebook.0, c.fragment))
            .collect();
        assert_eq!(kept, vec![(0, 3), (0, 7)]);
    }

    fn found(trajectory_deviation: f32) -> Match {
        Match {
            time: SamplingTime::at_frame(crate::core::types::SegmentIndex(1), 4),
            codebook: CodeBookIndex(0),
            deviation: trajectory_deviation,
            trajectory_deviation,
        }
    }

    #[test]
    fn test_hysteresis_switches_only_beyond_margin() {
        assert_eq!(hysteresis(found(0.2), Ok(1.0), 0.5), MatchResult::Matched(found(0.2)));
        assert_eq!(
            hysteresis(found(0.6), Ok(1.0), 0.5),
            MatchResult::NoCandidate(NoCandidateReason::BelowMargin {
                current_deviation: 1.0,
                candidate_deviation: 0.6,
            })
        );
        assert!(!hysteresis(found(0.5), Ok(1.0), 0.5).is_match());
    }

    #[test]
    fn test_hysteresis_rejects_unmeasurable_current_time() {
        let current = SamplingTime::at_frame(crate::core::types::SegmentIndex(0), 12);
        let result = hysteresis(found(0.0), Err(QueryError::InvalidSamplingTime(current)), 0.0);
        match result {
            MatchResult::NoCandidate(NoCandidateReason::InvalidQuery(message)) => {
                assert!(message.contains("Invalid sampling time"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_query_state_transitions() {
        let mut state = QueryState::new();
        assert_eq!(state.phase(), QueryPhase::Idle);
        assert!(!state.time().is_valid());
        state.play(SamplingTime::at_frame(crate::core::types::SegmentIndex(0), 3));
        assert_eq!(state.time().frame(), 3);
        assert!(state.last_result().is_none());
    }
}
