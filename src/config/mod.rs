// src/config/mod.rs
pub mod electrodes;

pub use electrodes::ElectrodeGeometry;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, PipelineResult};

/// Name of the experiment configuration file at the experiment root.
pub const CONFIG_FILE_NAME: &str = "realtime_mea.yaml";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub sampling_frequency: f64,
    pub n_channels: usize,
    pub filter_params: FilterParams,
    pub detect_threshold_for_spike_stats: f64,
    pub high_activity_threshold: f64,
    #[serde(default = "default_chunk_duration")]
    pub raw_chunk_duration_sec: f64,
    #[serde(default)]
    pub use_acquisition_folder: bool,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub shift_estimation: ShiftEstimationConfig,
    #[serde(default)]
    pub high_activity: HighActivityConfig,
    #[serde(default)]
    pub spike_detection: SpikeDetectionConfig,
    #[serde(default)]
    pub coarse_sorting: CoarseSortingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilterParams {
    pub lowcut: f64,
    pub highcut: f64,
    pub order: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessPolicy {
    /// Delete the stale artifact and compute it again.
    Recompute,
    /// Move the stale artifact to `computed/quarantine/`, alert, then compute it again.
    Quarantine,
    /// Stop the pipeline.
    FailFast,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub quiet_period_sec: f64,
    pub idle_sleep_sec: f64,
    pub reprocess_policy: ReprocessPolicy,
    pub num_workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quiet_period_sec: 5.0,
            idle_sleep_sec: 5.0,
            reprocess_policy: ReprocessPolicy::Recompute,
            num_workers: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ShiftEstimationConfig {
    /// Half-width of the coarse grid, in seconds per spatial unit.
    pub span: f64,
    pub grid_points: usize,
    pub coarse_duration_sec: f64,
    pub refine_duration_sec: f64,
}

impl Default for ShiftEstimationConfig {
    fn default() -> Self {
        Self {
            span: 2e-6,
            grid_points: 21,
            coarse_duration_sec: 0.5,
            refine_duration_sec: 0.5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HighActivityConfig {
    pub segment_duration_ms: f64,
    pub baseline_percentile: f64,
    pub min_consecutive_segments: usize,
}

impl Default for HighActivityConfig {
    fn default() -> Self {
        Self {
            segment_duration_ms: 20.0,
            baseline_percentile: 10.0,
            min_consecutive_segments: 3,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SpikeDetectionConfig {
    pub window_size: usize,
}

impl Default for SpikeDetectionConfig {
    fn default() -> Self {
        Self { window_size: 10 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatistic {
    Median,
    Mean,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusteringStrategy {
    Kmeans {
        num_clusters: usize,
        #[serde(default = "default_n_init")]
        n_init: usize,
        #[serde(default = "default_max_iterations")]
        max_iterations: usize,
        #[serde(default)]
        seed: u64,
    },
    Density {
        eps: f64,
        min_points: usize,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CoarseSortingConfig {
    pub detect_threshold: f64,
    pub template_statistic: TemplateStatistic,
    pub denoise_neighbors: Option<usize>,
    pub strategy: ClusteringStrategy,
}

impl Default for CoarseSortingConfig {
    fn default() -> Self {
        Self {
            detect_threshold: -80.0,
            template_statistic: TemplateStatistic::Median,
            denoise_neighbors: None,
            strategy: ClusteringStrategy::Kmeans {
                num_clusters: 70,
                n_init: default_n_init(),
                max_iterations: default_max_iterations(),
                seed: 0,
            },
        }
    }
}

fn default_chunk_duration() -> f64 {
    10.0
}

fn default_n_init() -> usize {
    10
}

fn default_max_iterations() -> usize {
    100
}

impl Config {
    /// Bytes in one frame (one `i16` sample per channel).
    pub fn bytes_per_frame(&self) -> u64 {
        2 * self.n_channels as u64
    }

    pub fn frames_per_chunk(&self) -> usize {
        (self.raw_chunk_duration_sec * self.sampling_frequency) as usize
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let fs = self.sampling_frequency;
        if !(fs.is_finite() && fs > 0.0) {
            return Err(PipelineError::config("sampling_frequency must be positive"));
        }
        if self.n_channels == 0 {
            return Err(PipelineError::config("n_channels must be at least 1"));
        }

        let filter = &self.filter_params;
        if filter.order == 0 {
            return Err(PipelineError::config("filter_params.order must be at least 1"));
        }
        if !(filter.lowcut > 0.0 && filter.lowcut < filter.highcut && filter.highcut < fs / 2.0) {
            return Err(PipelineError::config(format!(
                "filter_params must satisfy 0 < lowcut ({}) < highcut ({}) < fs/2 ({})",
                filter.lowcut,
                filter.highcut,
                fs / 2.0
            )));
        }

        if !(self.detect_threshold_for_spike_stats < 0.0) {
            return Err(PipelineError::config(
                "detect_threshold_for_spike_stats must be negative",
            ));
        }
        if !(self.high_activity_threshold >= 0.0) {
            return Err(PipelineError::config(
                "high_activity_threshold must be non-negative",
            ));
        }
        if !(self.raw_chunk_duration_sec > 0.0) || self.frames_per_chunk() == 0 {
            return Err(PipelineError::config(
                "raw_chunk_duration_sec must cover at least one frame",
            ));
        }

        if self.pipeline.quiet_period_sec < 0.0 || self.pipeline.idle_sleep_sec < 0.0 {
            return Err(PipelineError::config("pipeline periods must be non-negative"));
        }
        if self.pipeline.num_workers == Some(0) {
            return Err(PipelineError::config("pipeline.num_workers must be at least 1"));
        }

        let shifts = &self.shift_estimation;
        if shifts.grid_points < 2 || !(shifts.span > 0.0) {
            return Err(PipelineError::config(
                "shift_estimation needs span > 0 and at least 2 grid points",
            ));
        }
        if !(shifts.coarse_duration_sec > 0.0 && shifts.refine_duration_sec > 0.0) {
            return Err(PipelineError::config("shift_estimation durations must be positive"));
        }

        let activity = &self.high_activity;
        if !(activity.segment_duration_ms > 0.0) {
            return Err(PipelineError::config("high_activity.segment_duration_ms must be positive"));
        }
        if !(0.0..=100.0).contains(&activity.baseline_percentile) {
            return Err(PipelineError::config(
                "high_activity.baseline_percentile must be within [0, 100]",
            ));
        }

        if self.spike_detection.window_size == 0 {
            return Err(PipelineError::config("spike_detection.window_size must be at least 1"));
        }

        let sorting = &self.coarse_sorting;
        if !(sorting.detect_threshold < 0.0) {
            return Err(PipelineError::config("coarse_sorting.detect_threshold must be negative"));
        }
        if sorting.denoise_neighbors == Some(0) {
            return Err(PipelineError::config("coarse_sorting.denoise_neighbors must be at least 1"));
        }
        match &sorting.strategy {
            ClusteringStrategy::Kmeans {
                num_clusters,
                n_init,
                max_iterations,
                ..
            } => {
                if *num_clusters == 0 || *n_init == 0 || *max_iterations == 0 {
                    return Err(PipelineError::config(
                        "k-means needs num_clusters, n_init and max_iterations of at least 1",
                    ));
                }
            }
            ClusteringStrategy::Density { eps, min_points } => {
                if !(*eps > 0.0) || *min_points == 0 {
                    return Err(PipelineError::config(
                        "density clustering needs eps > 0 and min_points >= 1",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Reads and validates the experiment configuration.
pub fn load_config<P: AsRef<Path>>(path: P) -> PipelineResult<Config> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("failed to read {}: {}", path.display(), e))
    })?;

    let config: Config = serde_yaml::from_str(&config_str)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> PipelineResult<()> {
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config(n_channels: usize, sampling_frequency: f64) -> Config {
    Config {
        sampling_frequency,
        n_channels,
        filter_params: FilterParams {
            lowcut: sampling_frequency / 100.0,
            highcut: sampling_frequency / 5.0,
            order: 2,
        },
        detect_threshold_for_spike_stats: -40.0,
        high_activity_threshold: 3.0,
        raw_chunk_duration_sec: 1.0,
        use_acquisition_folder: false,
        pipeline: PipelineConfig {
            quiet_period_sec: 0.0,
            idle_sleep_sec: 0.0,
            ..PipelineConfig::default()
        },
        shift_estimation: ShiftEstimationConfig::default(),
        high_activity: HighActivityConfig::default(),
        spike_detection: SpikeDetectionConfig::default(),
        coarse_sorting: CoarseSortingConfig::default(),
    }
}
