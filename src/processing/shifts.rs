use std::fs;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ElectrodeGeometry, ShiftEstimationConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{atomic_write_bytes, ChunkMatrix};

/// Experiment-wide propagation coefficients, in seconds per spatial unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftCoefficients {
    pub c_x: f64,
    pub c_y: f64,
    pub source_chunk: String,
    pub best_score: Option<f64>,
    pub converged: bool,
}

impl ShiftCoefficients {
    pub fn load(path: &Path) -> PipelineResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map(Some)
            .map_err(|e| PipelineError::UnreadableArtifact {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        atomic_write_bytes(path, yaml.as_bytes())
    }

    pub fn shifts(&self, geometry: &ElectrodeGeometry, fs: f64) -> Vec<i64> {
        channel_shifts(geometry, self.c_x, self.c_y, fs)
    }
}

/// `round((c_x·x + c_y·y) · fs)` for every electrode.
pub fn channel_shifts(geometry: &ElectrodeGeometry, c_x: f64, c_y: f64, fs: f64) -> Vec<i64> {
    geometry
        .coords
        .iter()
        .map(|&(x, y)| ((c_x * x + c_y * y) * fs).round() as i64)
        .collect()
}

#[inline]
fn source_index(i: usize, shift: i64, n: usize) -> usize {
    (i as i64 - shift).rem_euclid(n as i64) as usize
}

/// Rotates every channel right by its shift; same shape as the input.
pub fn apply_shifts(chunk: &ChunkMatrix, shifts: &[i64]) -> ChunkMatrix {
    let n = chunk.frames;
    let channels = chunk.channels;
    let mut out = ChunkMatrix::zeros(n, channels);
    if n == 0 {
        return out;
    }
    for (ch, &shift) in shifts.iter().enumerate().take(channels) {
        for i in 0..n {
            out.samples[i * channels + ch] = chunk.get(source_index(i, shift, n), ch);
        }
    }
    out
}

/// Variance of the channel mean after alignment, over the frames no rotation
/// wrapped into. `+inf` when that window is empty.
pub fn score(chunk: &ChunkMatrix, shifts: &[i64]) -> f64 {
    let n = chunk.frames;
    if n == 0 || shifts.is_empty() {
        return f64::INFINITY;
    }
    let max_shift = shifts.iter().copied().max().unwrap_or(0);
    let min_shift = shifts.iter().copied().min().unwrap_or(0);
    let crop_start = max_shift.max(0);
    let crop_end = n as i64 - (-min_shift).max(0);
    if crop_end <= crop_start {
        return f64::INFINITY;
    }

    let channels = shifts.len() as f64;
    let means: Vec<f64> = (crop_start as usize..crop_end as usize)
        .map(|i| {
            shifts
                .iter()
                .enumerate()
                .map(|(ch, &s)| chunk.get(source_index(i, s, n), ch) as f64)
                .sum::<f64>()
                / channels
        })
        .collect();
    population_variance(&means)
}

pub fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let len = values.len() as f64;
    let mean = values.iter().sum::<f64>() / len;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len
}

/// `points` evenly spaced values over `[centre - span, centre + span]`.
pub fn linspace(centre: f64, span: f64, points: usize) -> Vec<f64> {
    if points < 2 {
        return vec![centre];
    }
    let step = 2.0 * span / (points - 1) as f64;
    (0..points).map(|i| centre - span + step * i as f64).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridOptimum {
    pub c_x: f64,
    pub c_y: f64,
    pub score: f64,
}

/// Scores every `(c_x, c_y)` pair in parallel and returns the best finite one.
/// Ties go to the earliest pair in row-major grid order.
pub fn grid_search(
    chunk: &ChunkMatrix,
    geometry: &ElectrodeGeometry,
    fs: f64,
    xs: &[f64],
    ys: &[f64],
) -> Option<GridOptimum> {
    let pairs: Vec<(usize, f64, f64)> = xs
        .iter()
        .flat_map(|&cx| ys.iter().map(move |&cy| (cx, cy)))
        .enumerate()
        .map(|(i, (cx, cy))| (i, cx, cy))
        .collect();

    pairs
        .par_iter()
        .filter_map(|&(i, c_x, c_y)| {
            let s = score(chunk, &channel_shifts(geometry, c_x, c_y, fs));
            s.is_finite().then_some((i, GridOptimum { c_x, c_y, score: s }))
        })
        .reduce_with(|a, b| {
            if b.1.score > a.1.score || (b.1.score == a.1.score && b.0 < a.0) {
                b
            } else {
                a
            }
        })
        .map(|(_, best)| best)
}

/// Coarse then refined grid search on the leading part of a filtered chunk.
pub fn estimate(
    chunk: &ChunkMatrix,
    geometry: &ElectrodeGeometry,
    fs: f64,
    config: &ShiftEstimationConfig,
    source_chunk: &str,
) -> ShiftCoefficients {
    let coarse_frames = (config.coarse_duration_sec * fs) as usize;
    let coarse_grid = linspace(0.0, config.span, config.grid_points);
    let coarse = grid_search(
        &chunk.head(coarse_frames),
        geometry,
        fs,
        &coarse_grid,
        &coarse_grid,
    );

    let Some(coarse) = coarse else {
        warn!(chunk = source_chunk, "every shift grid point was invalid; using (0, 0)");
        return ShiftCoefficients {
            c_x: 0.0,
            c_y: 0.0,
            source_chunk: source_chunk.to_string(),
            best_score: None,
            converged: false,
        };
    };
    info!(c_x = coarse.c_x, c_y = coarse.c_y, score = coarse.score, "coarse shift search");

    let refine_frames = (config.refine_duration_sec * fs) as usize;
    let fine_span = config.span / 10.0;
    let xs = linspace(coarse.c_x, fine_span, config.grid_points);
    let ys = linspace(coarse.c_y, fine_span, config.grid_points);
    let best = grid_search(&chunk.head(refine_frames), geometry, fs, &xs, &ys).unwrap_or(coarse);
    info!(c_x = best.c_x, c_y = best.c_y, score = best.score, "refined shift search");

    ShiftCoefficients {
        c_x: best.c_x,
        c_y: best.c_y,
        source_chunk: source_chunk.to_string(),
        best_score: Some(best.score),
        converged: true,
    }
}
