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

//! Time-sliced, cancellable database builder
//!
//! [`Builder::start`] assembles clips and annotations into tables and returns a
//! [`BuildTask`]. Each [`BuildTask::poll`] spends at most its budget driving the
//! Extract, Normalize, Train and Encode stages on the worker pool, and reports
//! [`BuildStatus::InProgress`] until the final binary is loaded.

pub mod assembly;
pub mod input;
pub mod scheduler;
pub mod stages;

use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::config::BuildConfig;
use crate::core::error::{BuildError, ConfigError};
use crate::core::registry::TypeRegistry;
use crate::features::rig::Rig;
use crate::storage::Binary;

pub use input::{
    Annotation, AnnotationRange, AnnotationSource, ClipDocument, ClipLibrary, JointTransform,
    MarkerDocument, SampledClip, SkeletonSampler, TagDocument,
};
pub use scheduler::{GraphHandle, JobGraph, JobHandle, JobResult, Slots, WorkerPool};

use stages::{Pipeline, StageOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStage {
    Extract,
    Normalize,
    Train,
    Encode,
}

impl BuildStage {
    pub const ALL: [BuildStage; 4] = [
        BuildStage::Extract,
        BuildStage::Normalize,
        BuildStage::Train,
        BuildStage::Encode,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuildStage::Extract => "extract",
            BuildStage::Normalize => "normalize",
            BuildStage::Train => "train",
            BuildStage::Encode => "encode",
        }
    }

    pub fn next(self) -> Option<BuildStage> {
        match self {
            BuildStage::Extract => Some(BuildStage::Normalize),
            BuildStage::Normalize => Some(BuildStage::Train),
            BuildStage::Train => Some(BuildStage::Encode),
            BuildStage::Encode => None,
        }
    }
}

/// Snapshot of a running build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    /// Stage currently running, or the last one finished
    pub stage: BuildStage,
    pub stages_completed: usize,
    pub jobs_completed: usize,
    pub jobs_total: usize,
}

impl BuildProgress {
    /// Overall completion in `[0, 1]`, counting each stage equally.
    pub fn fraction(&self) -> f32 {
        let within = if self.jobs_total == 0 {
            0.0
        } else {
            self.jobs_completed as f32 / self.jobs_total as f32
        };
        let stages = BuildStage::ALL.len() as f32;
        ((self.stages_completed as f32 + within) / stages).min(1.0)
    }
}

/// Environment driving a build.
pub trait BuildHost {
    /// Polled at every poll and stage boundary.
    fn should_cancel(&self) -> bool;

    /// Called once after each stage completes.
    fn report_progress(&self, _progress: &BuildProgress) {}
}

/// Host that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl BuildHost for NeverCancel {
    fn should_cancel(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub enum BuildStatus {
    InProgress(BuildProgress),
    Completed(Binary),
    Cancelled,
    Failed(BuildError),
}

pub struct Builder<'a> {
    config: BuildConfig,
    registry: &'a TypeRegistry,
    pool: &'a WorkerPool,
}

impl<'a> Builder<'a> {
    pub fn new(config: BuildConfig, registry: &'a TypeRegistry, pool: &'a WorkerPool) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            pool,
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Assembles the inputs and schedules the first stage.
    pub fn start(
        &self,
        rig: Rig,
        clips: &[&dyn SkeletonSampler],
        annotations: &dyn AnnotationSource,
    ) -> Result<BuildTask<'a>, BuildError> {
        info!(
            "🚀 Starting motion database build: {} clips, {} metrics, {} workers",
            clips.len(),
            self.config.metrics.len(),
            self.pool.num_threads()
        );
        let assembly = assembly::assemble(&self.config, self.registry, rig, clips, annotations)?;
        let pipeline = Pipeline::new(assembly, &self.config)?;
        info!(
            "🔧 Training {} codebooks over {} fragments",
            pipeline.num_codebooks(),
            pipeline.num_fragments()
        );

        let mut task = BuildTask {
            pool: self.pool,
            pipeline: Some(pipeline),
            running: None,
            stages_completed: 0,
            stage_started: Instant::now(),
            build_started: Instant::now(),
        };
        task.schedule(BuildStage::Extract)
            .map_err(|e| BuildError::stage(BuildStage::Extract.name(), e))?;
        Ok(task)
    }

    /// Runs a build to completion on the calling thread, polling with the
    /// configured frame budget.
    pub fn build(
        &self,
        rig: Rig,
        clips: &[&dyn SkeletonSampler],
        annotations: &dyn AnnotationSource,
        host: &dyn BuildHost,
    ) -> Result<Binary, BuildError> {
        let mut task = self.start(rig, clips, annotations)?;
        let budget = Duration::from_millis(self.config.frame_budget_ms.max(1));
        loop {
            match task.poll(host, budget) {
                BuildStatus::InProgress(_) => continue,
                BuildStatus::Completed(binary) => return Ok(binary),
                BuildStatus::Cancelled => return Err(BuildError::Cancelled),
                BuildStatus::Failed(error) => return Err(error),
            }
        }
    }
}

struct RunningStage {
    stage: BuildStage,
    handle: GraphHandle,
    output: StageOutput,
}

/// An in-flight build. Dropping it abandons the build.
pub struct BuildTask<'a> {
    pool: &'a WorkerPool,
    pipeline: Option<Pipeline>,
    running: Option<RunningStage>,
    stages_completed: usize,
    stage_started: Instant,
    build_started: Instant,
}

impl<'a> BuildTask<'a> {
    fn schedule(&mut self, stage: BuildStage) -> Result<(), BuildError> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| BuildError::Internal("build pipeline is gone".to_string()))?;
        let (graph, output) = pipeline.schedule(stage)?;
        let handle = self.pool.run(graph);
        self.running = Some(RunningStage {
            stage,
            handle,
            output,
        });
        self.stage_started = Instant::now();
        Ok(())
    }

    pub fn progress(&self) -> BuildProgress {
        match &self.running {
            Some(running) => {
                let (jobs_completed, jobs_total) = running.handle.progress();
                BuildProgress {
                    stage: running.stage,
                    stages_completed: self.stages_completed,
                    jobs_completed,
                    jobs_total,
                }
            }
            None => BuildProgress {
                stage: BuildStage::Encode,
                stages_completed: self.stages_completed,
                jobs_completed: 0,
                jobs_total: 0,
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pipeline.is_none()
    }

    fn abandon(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.cancel();
        }
        self.pipeline = None;
    }

    fn fail(&mut self, stage: BuildStage, error: BuildError) -> BuildStatus {
        self.abandon();
        let error = match error {
            BuildError::Stage { .. } | BuildError::Cancelled => error,
            other => BuildError::stage(stage.name(), other),
        };
        warn!("❌ Build failed: {}", error);
        BuildStatus::Failed(error)
    }

    fn cancel(&mut self) -> BuildStatus {
        self.abandon();
        info!("🛑 Build cancelled after {} stages", self.stages_completed);
        BuildStatus::Cancelled
    }

    /// Drives the build for at most `budget`, then returns.
    pub fn poll(&mut self, host: &dyn BuildHost, budget: Duration) -> BuildStatus {
        let deadline = Instant::now() + budget;
        loop {
            if self.pipeline.is_none() {
                return BuildStatus::Failed(BuildError::Internal(
                    "build task already finished".to_string(),
                ));
            }
            if host.should_cancel() {
                return self.cancel();
            }

            let Some(running) = self.running.as_ref() else {
                return self.fail(BuildStage::Encode, BuildError::Internal("no stage running".to_string()));
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !running.handle.wait_timeout(remaining) {
                return BuildStatus::InProgress(self.progress());
            }

            let Some(RunningStage {
                stage,
                handle,
                output,
            }) = self.running.take()
            else {
                continue;
            };
            if let Err(error) = handle.result() {
                return self.fail(stage, error);
            }
            let collected = match self.pipeline.as_mut() {
                Some(pipeline) => pipeline.collect(output),
                None => Err(BuildError::Internal("build pipeline is gone".to_string())),
            };
            if let Err(error) = collected {
                return self.fail(stage, error);
            }

            self.stages_completed += 1;
            let (jobs, _) = handle.progress();
            info!(
                "✅ Stage {} finished: {} jobs in {:?}",
                stage.name(),
                jobs,
                self.stage_started.elapsed()
            );
            host.report_progress(&BuildProgress {
                stage,
                stages_completed: self.stages_completed,
                jobs_completed: jobs,
                jobs_total: jobs,
            });

            match stage.next() {
                Some(next) => {
                    if host.should_cancel() {
                        return self.cancel();
                    }
                    if let Err(error) = self.schedule(next) {
                        return self.fail(next, error);
                    }
                }
                None => {
                    let Some(pipeline) = self.pipeline.take() else {
                        continue;
                    };
                    return match pipeline.finish() {
                        Ok(binary) => {
                            info!(
                                "🎉 Motion database built in {:?}: {} bytes, {} codebooks",
                                self.build_started.elapsed(),
                                binary.as_bytes().len(),
                                binary.num_codebooks()
                            );
                            BuildStatus::Completed(binary)
                        }
                        Err(error) => self.fail(stage, error),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = Some(BuildStage::Extract);
        let mut seen = Vec::new();
        while let Some(current) = stage {
            seen.push(current);
            stage = current.next();
        }
        assert_eq!(seen, BuildStage::ALL);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = BuildProgress {
            stage: BuildStage::Normalize,
            stages_completed: 1,
            jobs_completed: 5,
            jobs_total: 10,
        };
        assert!((progress.fraction() - 0.375).abs() < 1.0e-6);
    }
}
