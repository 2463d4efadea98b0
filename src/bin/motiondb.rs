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

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use motiondb::builder::ClipLibrary;
use motiondb::core::types::{SamplingTime, SegmentIndex, TraitIndex};
use motiondb::features::Float3;
use motiondb::search::{MatchQuery, MatchResult, QueryState, TagFilter, TrajectoryPrediction};
use motiondb::{Binary, BuildHost, BuildProgress, Config, MotionDB};

#[derive(Parser)]
#[command(name = "motiondb")]
#[command(about = "Build, inspect and query motion-matching databases")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured level (RUST_LOG also works)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a database from a JSON clip library
    Build {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        kmeans_attempts: Option<usize>,
        #[arg(long)]
        sample_rate: Option<f32>,
    },
    /// Print the tables of a database
    Inspect {
        database: PathBuf,
        /// Also list every interval
        #[arg(long)]
        intervals: bool,
    },
    /// Search a database with a predicted trajectory
    Query {
        database: PathBuf,
        /// Desired root velocity as x,y,z in the character frame
        #[arg(long, default_value = "0,0,1")]
        velocity: String,
        /// Desired facing as x,y,z; defaults to the velocity direction
        #[arg(long)]
        facing: Option<String>,
        /// Clip currently playing
        #[arg(long)]
        clip: Option<String>,
        #[arg(long, default_value_t = 0)]
        frame: i32,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
        #[arg(long)]
        metric: Option<String>,
    },
}

struct CliHost;

impl BuildHost for CliHost {
    fn should_cancel(&self) -> bool {
        false
    }

    fn report_progress(&self, progress: &BuildProgress) {
        info!(
            "📊 {} done ({}/4 stages, {:.0}%)",
            progress.stage.name(),
            progress.stages_completed,
            progress.fraction() * 100.0
        );
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_tracing(&config.logging.level);

    match cli.command {
        Commands::Build {
            input,
            output,
            seed,
            workers,
            kmeans_attempts,
            sample_rate,
        } => {
            if let Some(seed) = seed {
                config.build.seed = seed;
            }
            if let Some(workers) = workers {
                config.build.worker_threads = workers;
            }
            if let Some(attempts) = kmeans_attempts {
                config.build.kmeans_attempts = attempts;
            }
            if let Some(rate) = sample_rate {
                config.build.sample_rate = rate;
            }
            build(config, &input, &output)
        }
        Commands::Inspect { database, intervals } => inspect(config, &database, intervals),
        Commands::Query {
            database,
            velocity,
            facing,
            clip,
            frame,
            include,
            exclude,
            metric,
        } => {
            let velocity = parse_float3(&velocity).context("Invalid --velocity")?;
            let facing = match facing {
                Some(facing) => parse_float3(&facing).context("Invalid --facing")?,
                None => velocity,
            };
            let mut filter = TagFilter::any();
            filter.include = include;
            filter.exclude = exclude;
            query(config, &database, velocity, facing, clip.as_deref(), frame, filter, metric)
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build(config: Config, input: &Path, output: &Path) -> Result<()> {
    let db = MotionDB::new(config).context("Invalid configuration")?;
    let library = ClipLibrary::load(input).with_context(|| format!("Failed to read clip library {}", input.display()))?;
    let binary = db.build_library(&library, &CliHost).context("Build failed")?;
    binary
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} ({} bytes, {} segments, {} codebooks)",
        output.display(),
        binary.as_bytes().len(),
        binary.num_segments(),
        binary.num_codebooks()
    );
    Ok(())
}

fn inspect(config: Config, path: &Path, show_intervals: bool) -> Result<()> {
    let db = MotionDB::new(config)?;
    let binary = db.open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    println!("{}", path.display());
    println!(
        "  sample rate {} Hz, {} joints, {} frames, extraction policy {:?}",
        binary.sample_rate(),
        binary.rig().num_joints(),
        binary.num_frames(),
        binary.extraction_policy()
    );

    println!("Segments ({})", binary.num_segments());
    for index in 0..binary.num_segments() {
        let index = SegmentIndex::new(index);
        let (Some(segment), Some(name)) = (binary.segment(index), binary.segment_name(index)) else {
            continue;
        };
        println!(
            "  [{}] {:<24} frames {:>6}  tags {:>3}  markers {:>3}  prev {:>3}  next {:>3}",
            index, name, segment.num_frames, segment.num_tags, segment.num_markers, segment.previous_segment,
            segment.next_segment
        );
    }

    println!("Traits ({})", binary.num_traits());
    for index in 0..binary.num_traits() {
        let index = TraitIndex::new(index);
        let Some(record) = binary.trait_record(index) else {
            continue;
        };
        let type_name = binary.type_name(record.type_index).unwrap_or("?");
        let payload = binary
            .type_record(record.type_index)
            .zip(binary.trait_payload_bytes(index))
            .and_then(|(t, bytes)| db.registry().describe(t.hash, bytes))
            .unwrap_or_else(|| "<opaque>".to_string());
        println!("  [{}] {} {}", index, type_name, payload);
    }

    println!("Metrics ({})", binary.metrics().len());
    for metric in binary.metrics() {
        println!(
            "  {} joints {:?}, {} trajectory samples, ksub {}",
            metric.name(),
            metric.definition.joints,
            metric.definition.trajectory.total_samples(),
            metric.definition.ksub
        );
    }

    println!("CodeBooks ({})", binary.num_codebooks());
    for (index, codebook) in binary.codebooks().iter().enumerate() {
        println!(
            "  [{}] metric {} tag list {} intervals {}..{} fragments {} pose M={} ksub={} trajectory M={} ksub={}",
            index,
            codebook.metric,
            codebook.tag_list,
            codebook.interval_start,
            codebook.interval_start.0 + codebook.num_intervals as i32,
            codebook.num_fragments,
            codebook.poses.quantizer.num_sub_quantizers(),
            codebook.poses.quantizer.ksub(),
            codebook.trajectories.quantizer.num_sub_quantizers(),
            codebook.trajectories.quantizer.ksub()
        );
    }

    if show_intervals {
        println!("Intervals ({})", binary.num_intervals());
        for index in 0..binary.num_intervals() {
            if let Some(interval) = binary.interval(index.into()) {
                println!(
                    "  [{}] segment {} frames {}..{} tag list {} codebook {}",
                    index,
                    interval.segment,
                    interval.first_frame,
                    interval.first_frame + interval.num_frames,
                    interval.tag_list,
                    interval.codebook
                );
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn query(
    config: Config,
    path: &Path,
    velocity: Float3,
    facing: Float3,
    clip: Option<&str>,
    frame: i32,
    filter: TagFilter,
    metric: Option<String>,
) -> Result<()> {
    let db = MotionDB::new(config)?;
    let binary = db.open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let engine = db.engine(&binary)?;

    let current = match clip {
        Some(name) => {
            let segment = binary.find_segment(name);
            if !segment.is_valid() {
                bail!("No clip named '{}' in {}", name, path.display());
            }
            SamplingTime::at_frame(segment, frame)
        }
        None => SamplingTime::INVALID,
    };
    let current_velocity = played_velocity(&binary, current);

    let prediction = TrajectoryPrediction::new(db.config().search.prediction.clone());
    let mut query = MatchQuery::new(prediction.desired_trajectory(current_velocity, velocity, facing)).with_filter(filter);
    query.metric = metric;

    let mut state = QueryState::starting_at(current);
    match engine.find_match(&mut state, &query) {
        MatchResult::Matched(found) => {
            let name = binary.segment_name(found.time.segment()).unwrap_or("?");
            println!(
                "Matched {} frame {} (codebook {}, deviation {:.4}, trajectory {:.4})",
                name,
                found.time.frame(),
                found.codebook,
                found.deviation,
                found.trajectory_deviation
            );
        }
        MatchResult::NoCandidate(reason) => println!("No candidate: {:?}", reason),
    }
    Ok(())
}

/// Root velocity of the playing time in its own frame, zero when not playing.
fn played_velocity(binary: &Binary, current: SamplingTime) -> Float3 {
    if !binary.is_valid_time(current) {
        return Float3::zeros();
    }
    let step = 1.0 / binary.sample_rate();
    let ahead = binary.advance(current, step, binary.extraction_policy());
    match (binary.root_transform(current), binary.root_transform(ahead)) {
        (Ok(now), Ok(next)) => (now.inverse() * next).translation.vector / step,
        _ => Float3::zeros(),
    }
}

fn parse_float3(text: &str) -> Result<Float3> {
    let parts: Vec<f32> = text
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("'{}' is not a comma separated vector", text))?;
    if parts.len() != 3 {
        bail!("expected 3 components, got {}", parts.len());
    }
    Ok(Float3::new(parts[0], parts[1], parts[2]))
}
