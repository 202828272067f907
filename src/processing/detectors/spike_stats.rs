use serde::{Deserialize, Serialize};

use super::{detect_spikes, LocalMinimumDetector};
use crate::store::ChunkMatrix;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeStats {
    pub mean_firing_rates: Vec<f64>,
    pub mean_spike_amplitudes: Vec<f64>,
}

/// Per-channel firing rate (spikes/s) and mean amplitude (negated mean spike value).
pub fn compute_spike_stats(chunk: &ChunkMatrix, fs: f64, threshold: f64, window_size: usize) -> SpikeStats {
    let detector = LocalMinimumDetector::new(threshold, window_size);
    let events = detect_spikes(&detector, chunk);
    let duration = chunk.duration_sec(fs);

    let mut mean_firing_rates = Vec::with_capacity(chunk.channels);
    let mut mean_spike_amplitudes = Vec::with_capacity(chunk.channels);
    for channel_events in &events {
        let count = channel_events.len();
        mean_firing_rates.push(if duration > 0.0 {
            count as f64 / duration
        } else {
            0.0
        });
        mean_spike_amplitudes.push(if count == 0 {
            0.0
        } else {
            -channel_events.iter().map(|e| e.value).sum::<f64>() / count as f64
        });
    }

    SpikeStats {
        mean_firing_rates,
        mean_spike_amplitudes,
    }
}
