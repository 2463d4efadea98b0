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

//! End-to-end tests: build a database from synthetic clips, then search it

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use motiondb::builder::WorkerPool;
use motiondb::core::error::BuildError;
use motiondb::core::registry::{Locomotion, TypeRegistry};
use motiondb::core::types::{MetricIndex, SamplingTime};
use motiondb::features::{extract_pose_fragment, extract_trajectory_fragment};
use motiondb::search::{
    DesiredTrajectory, MatchQuery, MatchResult, MatchingEngine, NoCandidateReason, PoseSample, QueryPhase,
    QueryState, TagFilter,
};
use motiondb::storage::FragmentSetKind;
use motiondb::{BuildHost, BuildProgress, BuildStatus, Builder};

fn query_at(binary: &motiondb::Binary, time: SamplingTime) -> MatchQuery {
    let metric = MetricIndex(0);
    let pose = extract_pose_fragment(binary, metric, time).unwrap();
    let trajectory = extract_trajectory_fragment(binary, metric, time).unwrap();
    MatchQuery::new(DesiredTrajectory::Fragment(trajectory)).with_pose(PoseSample::Fragment(pose))
}

#[test]
fn test_built_binary_layout() {
    let binary = common::build_binary();

    assert_eq!(binary.num_segments(), 3);
    assert_eq!(binary.num_frames(), 270);
    assert_eq!(binary.rig().num_joints(), 4);
    assert_eq!(binary.num_codebooks(), 2);

    let total: u32 = binary.codebooks().iter().map(|c| c.num_fragments).sum();
    assert_eq!(total, 270);

    for (index, codebook) in binary.codebooks().iter().enumerate() {
        let index = motiondb::core::types::CodeBookIndex::new(index);
        let fragments = codebook.num_fragments as usize;
        let pose_m = codebook.poses.quantizer.num_sub_quantizers();
        assert_eq!(pose_m, 6);
        assert_eq!(binary.fragment_codes(index, FragmentSetKind::Pose).len(), fragments * pose_m);
        assert_eq!(
            binary.magnitude_codes(index, FragmentSetKind::Trajectory).len(),
            fragments * codebook.trajectories.num_quantizers()
        );
        assert!(codebook.poses.quantizer.ksub() <= 32);

        // Every fragment maps back onto a frame of its codebook's intervals.
        for fragment in [0, fragments - 1] {
            let time = binary.time_index_of_fragment(index, fragment);
            assert!(binary.is_valid_time(time));
        }
    }

    let walk = binary.find_segment("walk");
    assert!(walk.is_valid());
    let idle = binary.find_segment("idle");
    assert_eq!(binary.segment(idle).unwrap().next_segment, idle);
    assert!(binary.find_type::<Locomotion>().is_valid());
}

#[test]
fn test_query_from_known_time_finds_it() {
    let binary = common::build_binary();
    let engine = MatchingEngine::new(&binary, common::search_config()).unwrap();
    let walk = binary.find_segment("walk");
    let target = SamplingTime::at_frame(walk, 20);

    let result = engine.search(SamplingTime::INVALID, &query_at(&binary, target));
    let found = result.matched().expect("a match");
    assert_eq!(found.time.segment(), walk);
    assert!((found.time.frame() - 20).abs() <= 1, "landed on frame {}", found.time.frame());
    assert!(found.deviation < 1.0e-3);
}

#[test]
fn test_parallel_scan_matches_serial() {
    let binary = common::build_binary();
    let serial = MatchingEngine::new(&binary, common::search_config()).unwrap();
    let mut config = common::search_config();
    config.parallel_codebooks = true;
    let parallel = MatchingEngine::new(&binary, config).unwrap();

    let circle = binary.find_segment("circle");
    for frame in [5, 40, 77] {
        let query = query_at(&binary, SamplingTime::at_frame(circle, frame));
        assert_eq!(
            serial.search(SamplingTime::INVALID, &query),
            parallel.search(SamplingTime::INVALID, &query)
        );
    }
}

#[test]
fn test_hysteresis_holds_current_time() {
    let binary = common::build_binary();
    let engine = MatchingEngine::new(&binary, common::search_config()).unwrap();
    let walk = binary.find_segment("walk");
    let current = SamplingTime::at_frame(walk, 30);
    let query = query_at(&binary, current);

    let mut state = QueryState::starting_at(current);
    for _ in 0..3 {
        let result = engine.find_match(&mut state, &query);
        assert!(matches!(
            result,
            MatchResult::NoCandidate(NoCandidateReason::BelowMargin { .. })
        ));
        assert_eq!(state.time(), current);
        assert_eq!(state.phase(), QueryPhase::NoCandidate);
    }
}

fn engine_with_margin(binary: &motiondb::Binary, margin: f32) -> MatchingEngine<'_> {
    let mut config = common::search_config();
    config.min_trajectory_deviation_margin = margin;
    MatchingEngine::new(binary, config).unwrap()
}

#[test]
fn test_margin_decides_switch_from_worse_current_time() {
    let binary = common::build_binary();
    let walk = binary.find_segment("walk");
    let current = SamplingTime::at_frame(binary.find_segment("idle"), 10);
    let query = query_at(&binary, SamplingTime::at_frame(walk, 20));

    // Read both deviations back through an unbeatable margin.
    let (current_deviation, candidate_deviation) =
        match engine_with_margin(&binary, 1.0e6).find_match(&mut QueryState::starting_at(current), &query) {
            MatchResult::NoCandidate(NoCandidateReason::BelowMargin {
                current_deviation,
                candidate_deviation,
            }) => (current_deviation, candidate_deviation),
            other => panic!("expected the current time to hold, got {:?}", other),
        };
    let improvement = current_deviation - candidate_deviation;
    assert!(improvement > 0.0, "idle should trail the walk query: {} vs {}", current_deviation, candidate_deviation);

    // Improvement smaller than the margin: stay put, every frame.
    let holding = engine_with_margin(&binary, improvement * 1.5);
    let mut state = QueryState::starting_at(current);
    for _ in 0..3 {
        let result = holding.find_match(&mut state, &query);
        assert_eq!(
            result,
            MatchResult::NoCandidate(NoCandidateReason::BelowMargin {
                current_deviation,
                candidate_deviation,
            })
        );
        assert_eq!(state.time(), current);
        assert_eq!(state.phase(), QueryPhase::NoCandidate);
    }

    // Improvement larger than the margin: switch, to the same place every time.
    let switching = engine_with_margin(&binary, improvement * 0.5);
    let mut previous = None;
    for _ in 0..3 {
        let mut state = QueryState::starting_at(current);
        let found = *switching.find_match(&mut state, &query).matched().expect("improvement beats the margin");
        assert_ne!(found.time, current);
        assert_eq!(found.trajectory_deviation, candidate_deviation);
        assert_eq!(state.time(), found.time);
        assert_eq!(state.phase(), QueryPhase::Matched);
        if let Some(previous) = previous {
            assert_eq!(found, previous);
        }
        previous = Some(found);
    }
}

#[test]
fn test_switches_away_from_idle() {
    let binary = common::build_binary();
    let mut config = common::search_config();
    config.trajectory_weight = 0.9;
    let engine = MatchingEngine::new(&binary, config).unwrap();
    let idle = binary.find_segment("idle");
    let walk = binary.find_segment("walk");

    let desired = extract_trajectory_fragment(&binary, MetricIndex(0), SamplingTime::at_frame(walk, 20)).unwrap();
    let query = MatchQuery::new(DesiredTrajectory::Fragment(desired));
    let mut state = QueryState::starting_at(SamplingTime::at_frame(idle, 10));

    let result = engine.find_match(&mut state, &query);
    let found = result.matched().expect("walking beats standing");
    assert_ne!(found.time.segment(), idle);
    assert_eq!(state.time(), found.time);
    assert_eq!(state.phase(), QueryPhase::Matched);

    engine.advance_time(&mut state, 0.5);
    assert_eq!(state.time().frame(), found.time.frame() + 15);
}

#[test]
fn test_tag_filters() {
    let binary = common::build_binary();
    let engine = MatchingEngine::new(&binary, common::search_config()).unwrap();
    let walk = binary.find_segment("walk");
    let idle = binary.find_segment("idle");
    let query = query_at(&binary, SamplingTime::at_frame(walk, 20));

    let only_idle = query.clone().with_filter(TagFilter::any().include("Idle"));
    let result = engine.search(SamplingTime::INVALID, &only_idle);
    assert_eq!(result.matched().unwrap().time.segment(), idle);

    let no_locomotion = query.clone().with_filter(TagFilter::any().exclude("Locomotion").exclude("Vault"));
    let result = engine.search(SamplingTime::INVALID, &no_locomotion);
    assert_eq!(result.matched().unwrap().time.segment(), idle);

    let unknown = query.clone().with_filter(TagFilter::any().include("Vault"));
    assert_eq!(
        engine.search(SamplingTime::INVALID, &unknown),
        MatchResult::NoCandidate(NoCandidateReason::UnknownFilterType("Vault".to_string()))
    );

    let nothing = query
        .clone()
        .with_filter(TagFilter::any().include("Idle").include("Locomotion"));
    assert_eq!(
        engine.search(SamplingTime::INVALID, &nothing),
        MatchResult::NoCandidate(NoCandidateReason::NoApplicableCodeBook)
    );

    let wrong_metric = query.with_metric("jump");
    assert!(matches!(
        engine.search(SamplingTime::INVALID, &wrong_metric),
        MatchResult::NoCandidate(NoCandidateReason::UnknownMetric(_))
    ));
}

#[test]
fn test_mismatched_query_is_not_fatal() {
    let binary = common::build_binary();
    let engine = MatchingEngine::new(&binary, common::search_config()).unwrap();
    let query = MatchQuery::new(DesiredTrajectory::Fragment(motiondb::features::FeatureVector::new(vec![])));
    assert!(matches!(
        engine.search(SamplingTime::INVALID, &query),
        MatchResult::NoCandidate(NoCandidateReason::InvalidQuery(_))
    ));
}

struct CancelAfterStages {
    stages: usize,
    reported: AtomicUsize,
}

impl BuildHost for CancelAfterStages {
    fn should_cancel(&self) -> bool {
        self.reported.load(Ordering::SeqCst) >= self.stages
    }

    fn report_progress(&self, _progress: &BuildProgress) {
        self.reported.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_cancel_after_first_stage() {
    let registry = TypeRegistry::with_builtins();
    let pool = WorkerPool::new(2).unwrap();
    let library = common::library(&registry);
    let builder = Builder::new(common::build_config(), &registry, &pool).unwrap();
    let host = CancelAfterStages {
        stages: 1,
        reported: AtomicUsize::new(0),
    };

    let mut task = builder
        .start(common::rig(), &library.samplers(), &library.annotations)
        .unwrap();
    let status = loop {
        match task.poll(&host, Duration::from_millis(5)) {
            BuildStatus::InProgress(progress) => assert_eq!(progress.stages_completed, 0),
            other => break other,
        }
    };
    assert!(matches!(status, BuildStatus::Cancelled));
    assert_eq!(host.reported.load(Ordering::SeqCst), 1);
    assert!(task.is_finished());
    assert!(matches!(task.poll(&host, Duration::from_millis(1)), BuildStatus::Failed(_)));

    let result = builder.build(common::rig(), &library.samplers(), &library.annotations, &host);
    assert!(matches!(result, Err(BuildError::Cancelled)));
}

#[test]
fn test_progress_reported_for_every_stage() {
    let registry = TypeRegistry::with_builtins();
    let pool = WorkerPool::new(3).unwrap();
    let library = common::library(&registry);
    let builder = Builder::new(common::build_config(), &registry, &pool).unwrap();
    let host = CancelAfterStages {
        stages: usize::MAX,
        reported: AtomicUsize::new(0),
    };

    let binary = builder
        .build(common::rig(), &library.samplers(), &library.annotations, &host)
        .unwrap();
    assert_eq!(host.reported.load(Ordering::SeqCst), 4);
    assert_eq!(binary.num_codebooks(), 2);
}

#[test]
fn test_build_is_deterministic() {
    let a = common::build_binary();
    let b = common::build_binary();
    assert_eq!(a.as_bytes(), b.as_bytes());
}
