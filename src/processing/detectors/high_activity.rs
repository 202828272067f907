use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::HighActivityConfig;
use crate::processing::shifts::population_variance;
use crate::store::ChunkMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub start_sec: f64,
    pub end_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HighActivityIntervals {
    pub high_activity_intervals: Vec<Interval>,
}

impl HighActivityIntervals {
    pub fn total_duration(&self) -> f64 {
        self.high_activity_intervals
            .iter()
            .map(|i| i.end_sec - i.start_sec)
            .sum()
    }
}

pub fn segment_frames(config: &HighActivityConfig, fs: f64) -> usize {
    ((config.segment_duration_ms * fs / 1000.0) as usize).max(1)
}

/// Mean over channels of each segment's per-channel population variance.
pub fn segment_scores(chunk: &ChunkMatrix, seg_frames: usize) -> Vec<f64> {
    let n_segments = (chunk.frames + seg_frames - 1) / seg_frames;
    (0..n_segments)
        .into_par_iter()
        .map(|seg| {
            let start = seg * seg_frames;
            let end = (start + seg_frames).min(chunk.frames);
            let total: f64 = (0..chunk.channels)
                .map(|ch| {
                    let values: Vec<f64> = (start..end).map(|f| chunk.get(f, ch) as f64).collect();
                    population_variance(&values)
                })
                .sum();
            total / chunk.channels.max(1) as f64
        })
        .collect()
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Intervals of sustained high variance relative to the chunk's quiet baseline.
/// A `multiplier` of zero disables detection.
pub fn detect_high_activity(
    chunk: &ChunkMatrix,
    fs: f64,
    multiplier: f64,
    config: &HighActivityConfig,
) -> HighActivityIntervals {
    if multiplier == 0.0 || chunk.frames == 0 {
        return HighActivityIntervals::default();
    }
    let seg_frames = segment_frames(config, fs);
    let scores = segment_scores(chunk, seg_frames);
    let threshold = percentile(&scores, config.baseline_percentile) * multiplier;

    let seg_sec = seg_frames as f64 / fs;
    let duration = chunk.duration_sec(fs);
    let min_run = config.min_consecutive_segments.max(1);

    let mut intervals = Vec::new();
    let mut run_start: Option<usize> = None;
    for (seg, &score) in scores.iter().enumerate() {
        match (score > threshold, run_start) {
            (true, None) => run_start = Some(seg),
            (false, Some(start)) => {
                push_run(&mut intervals, start, seg - 1, min_run, seg_sec, duration);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        push_run(&mut intervals, start, scores.len() - 1, min_run, seg_sec, duration);
    }

    HighActivityIntervals {
        high_activity_intervals: intervals,
    }
}

fn push_run(
    intervals: &mut Vec<Interval>,
    start: usize,
    end: usize,
    min_run: usize,
    seg_sec: f64,
    duration: f64,
) {
    if end + 1 - start >= min_run {
        intervals.push(Interval {
            start_sec: start as f64 * seg_sec,
            end_sec: ((end + 1) as f64 * seg_sec).min(duration),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 1000.0;

    /// 20 ms segments at 1 kHz are 20 frames; `loud` lists noisy segments.
    fn chunk_with_loud_segments(n_segments: usize, loud: &[usize]) -> ChunkMatrix {
        let frames = n_segments * 20;
        let traces: Vec<Vec<i16>> = (0..2)
            .map(|ch| {
                (0..frames)
                    .map(|f| {
                        let amp = if loud.contains(&(f / 20)) { 100 } else { 2 };
                        if (f + ch) % 2 == 0 { amp } else { -amp }
                    })
                    .collect()
            })
            .collect();
        ChunkMatrix::from_channels(&traces)
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 50.0), 2.5);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 10.0), 1.4);
        assert_eq!(percentile(&[7.0], 10.0), 7.0);
    }

    #[test]
    fn short_runs_are_dropped() {
        let chunk = chunk_with_loud_segments(20, &[3, 4, 10, 11, 12, 13]);
        let out = detect_high_activity(&chunk, FS, 3.0, &HighActivityConfig::default());
        assert_eq!(out.high_activity_intervals.len(), 1);
        let interval = out.high_activity_intervals[0];
        assert!((interval.start_sec - 0.2).abs() < 1e-12);
        assert!((interval.end_sec - 0.28).abs() < 1e-12);
        assert!((out.total_duration() - 0.08).abs() < 1e-12);
    }

    #[test]
    fn run_at_end_is_closed() {
        let chunk = chunk_with_loud_segments(10, &[7, 8, 9]);
        let out = detect_high_activity(&chunk, FS, 3.0, &HighActivityConfig::default());
        assert_eq!(out.high_activity_intervals.len(), 1);
        let interval = out.high_activity_intervals[0];
        assert!((interval.start_sec - 0.14).abs() < 1e-12);
        assert!((interval.end_sec - 0.2).abs() < 1e-12);
    }

    #[test]
    fn zero_multiplier_bypasses() {
        let chunk = chunk_with_loud_segments(10, &[1, 2, 3, 4]);
        let out = detect_high_activity(&chunk, FS, 0.0, &HighActivityConfig::default());
        assert!(out.high_activity_intervals.is_empty());
    }

    #[test]
    fn partial_last_segment_is_scored() {
        let chunk = chunk_with_loud_segments(3, &[]).head(45);
        assert_eq!(segment_scores(&chunk, 20).len(), 3);
    }
}
