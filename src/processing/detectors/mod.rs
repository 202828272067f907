pub mod high_activity;
pub mod spike_stats;

use rayon::prelude::*;

use crate::store::ChunkMatrix;

// DETECTOR COMPONENT ----------------------------------------------------------
pub trait DetectorInstance: Send + Sync {
    fn id(&self) -> &str;
    /// Frame indices of the events found in one trace.
    fn detect(&self, trace: &[f64]) -> Vec<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeEvent {
    pub frame: usize,
    pub channel: usize,
    pub value: f64,
}

/// Negative-going local minimum detector.
///
/// A sample `v` at `i` is a spike when `v <= threshold` and, for every offset
/// `o` in `[-w/2, w/2]` other than 0 that stays inside the trace, `v < x[i+o]`
/// before it and `v <= x[i+o]` after it. A flat minimum is reported once, at
/// its first sample.
#[derive(Debug, Clone)]
pub struct LocalMinimumDetector {
    pub threshold: f64,
    pub window_size: usize,
}

impl LocalMinimumDetector {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window_size,
        }
    }

    fn is_spike(&self, trace: &[f64], i: usize) -> bool {
        let v = trace[i];
        if !(v <= self.threshold) {
            return false;
        }
        let half = self.window_size / 2;
        let lo = i.saturating_sub(half);
        let hi = (i + half).min(trace.len() - 1);
        trace[lo..i].iter().all(|&u| v < u) && trace[i + 1..=hi].iter().all(|&u| v <= u)
    }
}

impl DetectorInstance for LocalMinimumDetector {
    fn id(&self) -> &str {
        "local_minimum"
    }

    fn detect(&self, trace: &[f64]) -> Vec<usize> {
        (0..trace.len()).filter(|&i| self.is_spike(trace, i)).collect()
    }
}

/// Runs `detector` on every channel in parallel; events come back ordered by
/// channel, then frame.
pub fn detect_spikes(detector: &dyn DetectorInstance, chunk: &ChunkMatrix) -> Vec<Vec<SpikeEvent>> {
    (0..chunk.channels)
        .into_par_iter()
        .map(|channel| {
            let trace = chunk.channel(channel);
            detector
                .detect(&trace)
                .into_iter()
                .map(|frame| SpikeEvent {
                    frame,
                    channel,
                    value: trace[frame],
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_exactly_at_threshold_counts_once() {
        let detector = LocalMinimumDetector::new(-50.0, 10);
        let trace = [0.0, -10.0, -50.0, -10.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(detector.detect(&trace), vec![2]);
    }

    #[test]
    fn plateau_reports_earlier_sample() {
        let detector = LocalMinimumDetector::new(-50.0, 10);
        let trace = [0.0, -20.0, -90.0, -90.0, -20.0, 0.0];
        assert_eq!(detector.detect(&trace), vec![2]);
    }

    #[test]
    fn deeper_neighbour_in_window_blocks() {
        let detector = LocalMinimumDetector::new(-50.0, 10);
        let mut trace = vec![0.0; 30];
        trace[10] = -60.0;
        trace[14] = -80.0;
        trace[25] = -70.0;
        assert_eq!(detector.detect(&trace), vec![14, 25]);
    }

    #[test]
    fn edges_do_not_block() {
        let detector = LocalMinimumDetector::new(-50.0, 10);
        let trace = [-60.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -55.0];
        assert_eq!(detector.detect(&trace), vec![0, 8]);
        assert!(detector.detect(&[]).is_empty());
    }

    #[test]
    fn multichannel_events_keep_channel() {
        let chunk = ChunkMatrix::from_channels(&[vec![0, -100, 0, 0], vec![-70, 0, 0, -90]]);
        let events = detect_spikes(&LocalMinimumDetector::new(-50.0, 2), &chunk);
        assert_eq!(events[0].len(), 1);
        assert_eq!(events[0][0].frame, 1);
        assert_eq!(
            events[1].iter().map(|e| e.frame).collect::<Vec<_>>(),
            vec![0, 3]
        );
        assert_eq!(events[1][1].value, -90.0);
    }
}
