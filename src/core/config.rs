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

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::core::error::ConfigError;
use crate::core::types::EndOfSegmentPolicy;
use crate::features::metric::MetricDefinition;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Frames per second at which clips are resampled into the binary
    pub sample_rate: f32,
    pub kmeans_attempts: usize,
    pub kmeans_iterations: usize,
    pub seed: u64,
    /// Symmetric perturbation applied when an empty cluster is split off a populated one
    pub cluster_split_epsilon: f32,
    /// Fragments per extraction/encoding job
    pub fragment_chunk_size: usize,
    /// 0 means one worker per logical CPU
    pub worker_threads: usize,
    pub frame_budget_ms: u64,
    /// Boundary handling when trajectory samples run past a segment
    pub end_of_segment: EndOfSegmentPolicy,
    pub metrics: Vec<MetricDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates kept from the approximate scan for exact re-ranking
    pub max_approximate_candidates: usize,
    pub min_trajectory_deviation_margin: f32,
    /// Weight of the trajectory term against the pose term, in `[0, 1]`
    pub trajectory_weight: f32,
    /// Boundary handling when advancing the playing time
    pub end_of_segment: EndOfSegmentPolicy,
    pub parallel_codebooks: bool,
    pub prediction: PredictionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub velocity_factor: f32,
    pub rotation_factor: f32,
    pub horizon_seconds: f32,
    pub num_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            sample_rate: 30.0,
            kmeans_attempts: 1,
            kmeans_iterations: 25,
            seed: 42,
            cluster_split_epsilon: 1.0 / 1024.0,
            fragment_chunk_size: 256,
            worker_threads: 0,
            frame_budget_ms: 10,
            end_of_segment: EndOfSegmentPolicy::FollowLink,
            metrics: vec![MetricDefinition::default_locomotion()],
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_approximate_candidates: 16,
            min_trajectory_deviation_margin: 0.03,
            trajectory_weight: 0.6,
            end_of_segment: EndOfSegmentPolicy::Saturate,
            parallel_codebooks: false,
            prediction: PredictionConfig::default(),
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            velocity_factor: 5.0,
            rotation_factor: 5.0,
            horizon_seconds: 1.0,
            num_steps: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.build.validate()?;
        self.search.validate()
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(invalid(format!("sample_rate must be positive, got {}", self.sample_rate)));
        }
        if self.kmeans_attempts == 0 || self.kmeans_iterations == 0 {
            return Err(invalid("kmeans_attempts and kmeans_iterations must be at least 1"));
        }
        if !(self.cluster_split_epsilon.is_finite() && self.cluster_split_epsilon > 0.0) {
            return Err(invalid("cluster_split_epsilon must be positive"));
        }
        if self.fragment_chunk_size == 0 {
            return Err(invalid("fragment_chunk_size must be at least 1"));
        }
        if self.metrics.is_empty() {
            return Err(invalid("at least one metric must be defined"));
        }

        let mut names = HashSet::new();
        for metric in &self.metrics {
            if !names.insert(metric.name.as_str()) {
                return Err(invalid(format!("duplicate metric name '{}'", metric.name)));
            }
            metric
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_approximate_candidates == 0 {
            return Err(invalid("max_approximate_candidates must be at least 1"));
        }
        if !(self.min_trajectory_deviation_margin >= 0.0) {
            return Err(invalid("min_trajectory_deviation_margin must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.trajectory_weight) {
            return Err(invalid(format!(
                "trajectory_weight must be within [0, 1], got {}",
                self.trajectory_weight
            )));
        }
        let prediction = &self.prediction;
        if !(prediction.velocity_factor >= 0.0 && prediction.rotation_factor >= 0.0) {
            return Err(invalid("prediction factors must be non-negative"));
        }
        if !(prediction.horizon_seconds > 0.0) || prediction.num_steps == 0 {
            return Err(invalid("prediction horizon and step count must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
