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

//! # MotionDB - Motion-Matching Feature Database
//!
//! MotionDB compresses a library of animation clips into a compact, immutable
//! binary and searches it every frame for the fragment that best continues the
//! character's current pose along a desired trajectory.
//!
//! ## Key Features
//!
//! - **Product Quantization**: pose and trajectory fragments encode to one byte per sub-vector
//! - **Deterministic Training**: seeded K-means with empty-cluster repair
//! - **Time-Sliced Builds**: cancellable four-stage pipeline on a worker pool
//! - **Zero-Copy Loading**: checksummed blob, memory-mapped from disk
//! - **Stable Matching**: exact re-rank and hysteresis against needless switching

pub mod builder;
pub mod compute;
pub mod core;
pub mod features;
pub mod search;
pub mod storage;

pub use crate::core::*;
pub use builder::{BuildHost, BuildProgress, BuildStage, BuildStatus, BuildTask, Builder, NeverCancel};
pub use search::{MatchQuery, MatchResult, MatchingEngine, QueryState};
pub use storage::Binary;

use std::path::Path;
use tracing::info;

use builder::{ClipLibrary, SkeletonSampler, WorkerPool};

/// Owns the registry and worker pool shared by builds and searches.
pub struct MotionDB {
    config: Config,
    registry: TypeRegistry,
    pool: WorkerPool,
}

impl MotionDB {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_registry(config, TypeRegistry::with_builtins())
    }

    pub fn with_registry(config: Config, registry: TypeRegistry) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.build.effective_worker_threads())?;
        info!(
            "🚀 MotionDB ready: {} trait types, {} workers",
            registry.len(),
            pool.num_threads()
        );
        Ok(Self {
            config,
            registry,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn builder(&self) -> Result<Builder<'_>> {
        Ok(Builder::new(self.config.build.clone(), &self.registry, &self.pool)?)
    }

    /// Builds a binary from a clip library, blocking until done or cancelled.
    pub fn build_library(&self, library: &ClipLibrary, host: &dyn BuildHost) -> Result<Binary> {
        let rig = library.rig()?;
        let clips = library.clips();
        let annotations = library.annotations(&self.registry)?;
        let samplers: Vec<&dyn SkeletonSampler> = clips.iter().map(|c| c as &dyn SkeletonSampler).collect();
        Ok(self.builder()?.build(rig, &samplers, &annotations, host)?)
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Binary> {
        Ok(Binary::open(path)?)
    }

    pub fn engine<'a>(&self, binary: &'a Binary) -> Result<MatchingEngine<'a>> {
        Ok(MatchingEngine::new(binary, self.config.search.clone())?)
    }
}
