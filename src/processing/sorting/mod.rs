pub mod density;
pub mod kmeans;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{ClusteringStrategy, CoarseSortingConfig, ElectrodeGeometry, TemplateStatistic};
use crate::processing::detectors::high_activity::Interval;
use crate::processing::detectors::{DetectorInstance, LocalMinimumDetector};
use crate::store::ChunkMatrix;

use density::Dbscan;
use kmeans::{KMeans, KMeansConfig};

/// Label carried by spikes that belong to no cluster.
pub const NOISE_LABEL: usize = 0;

// CLUSTERING COMPONENT --------------------------------------------------------
pub trait ClusteringInstance: Send + Sync {
    fn id(&self) -> &str;
    /// One label per point: `1..` for clusters, `NOISE_LABEL` for outliers.
    fn cluster(&self, points: &[Vec<f64>]) -> Vec<usize>;
}

pub fn clustering_for(strategy: &ClusteringStrategy) -> Box<dyn ClusteringInstance> {
    match strategy {
        ClusteringStrategy::Kmeans {
            num_clusters,
            n_init,
            max_iterations,
            seed,
        } => Box::new(KMeans::new(KMeansConfig {
            num_clusters: *num_clusters,
            n_init: *n_init,
            max_iterations: *max_iterations,
            seed: *seed,
        })),
        ClusteringStrategy::Density { eps, min_points } => Box::new(Dbscan::new(*eps, *min_points)),
    }
}

#[inline]
pub(crate) fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// RESULTS ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoarseSorting {
    /// `templates.len() × n_channels`, sorted by peak-channel x.
    pub templates: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
    pub spike_frames: Vec<usize>,
    pub spike_times_sec: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

impl CoarseSorting {
    pub fn flat_templates(&self) -> Vec<f32> {
        self.templates.iter().flatten().copied().collect()
    }

    pub fn sidecar(&self) -> SpikeSidecar {
        SpikeSidecar {
            num_templates: self.templates.len(),
            spike_times_sec: self.spike_times_sec.clone(),
            labels: self.labels.clone(),
            amplitudes: self.amplitudes.clone(),
        }
    }
}

/// Per-spike coarse sorting output stored next to the templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeSidecar {
    pub num_templates: usize,
    pub spike_times_sec: Vec<f64>,
    pub labels: Vec<usize>,
    pub amplitudes: Vec<f64>,
}

// STEPS -----------------------------------------------------------------------

/// Zeroes every frame inside the given intervals.
pub fn blank_intervals(chunk: &ChunkMatrix, intervals: &[Interval], fs: f64) -> ChunkMatrix {
    let mut out = chunk.clone();
    for interval in intervals {
        let start = ((interval.start_sec * fs).floor().max(0.0) as usize).min(chunk.frames);
        let end = ((interval.end_sec * fs).floor().max(0.0) as usize).min(chunk.frames);
        if start < end {
            out.samples[start * chunk.channels..end * chunk.channels].fill(0);
        }
    }
    out
}

/// Per-frame minimum across channels.
pub fn min_channel_trace(chunk: &ChunkMatrix) -> Vec<f64> {
    (0..chunk.frames)
        .map(|f| chunk.frame(f).iter().copied().min().unwrap_or(0) as f64)
        .collect()
}

/// Replaces each point with the mean of its `k` nearest points (itself included).
pub fn denoise(points: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
    let k = k.min(points.len());
    if k <= 1 {
        return points.to_vec();
    }
    points
        .par_iter()
        .map(|p| {
            let mut by_distance: Vec<(f64, usize)> = points
                .iter()
                .enumerate()
                .map(|(j, q)| (squared_distance(p, q), j))
                .collect();
            by_distance.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let mut mean = vec![0.0; p.len()];
            for &(_, j) in by_distance.iter().take(k) {
                for (m, v) in mean.iter_mut().zip(&points[j]) {
                    *m += v;
                }
            }
            mean.iter_mut().for_each(|m| *m /= k as f64);
            mean
        })
        .collect()
}

/// Drops unused labels and renumbers the rest `1..=K`, keeping their relative
/// order. Noise stays noise.
pub fn compact_labels(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut present: Vec<usize> = labels.iter().copied().filter(|&l| l != NOISE_LABEL).collect();
    present.sort_unstable();
    present.dedup();
    let remapped = labels
        .iter()
        .map(|&l| {
            if l == NOISE_LABEL {
                NOISE_LABEL
            } else {
                present.binary_search(&l).map_or(NOISE_LABEL, |i| i + 1)
            }
        })
        .collect();
    (remapped, present.len())
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// One template per label `1..=count`.
pub fn compute_templates(
    frames: &[Vec<f64>],
    labels: &[usize],
    count: usize,
    statistic: TemplateStatistic,
) -> Vec<Vec<f32>> {
    let channels = frames.first().map_or(0, Vec::len);
    (1..=count)
        .map(|label| {
            let members: Vec<&Vec<f64>> = frames
                .iter()
                .zip(labels)
                .filter(|(_, &l)| l == label)
                .map(|(f, _)| f)
                .collect();
            (0..channels)
                .map(|ch| {
                    let mut values: Vec<f64> = members.iter().map(|f| f[ch]).collect();
                    let v = match statistic {
                        TemplateStatistic::Median => median(&mut values),
                        TemplateStatistic::Mean => {
                            values.iter().sum::<f64>() / values.len().max(1) as f64
                        }
                    };
                    v as f32
                })
                .collect()
        })
        .collect()
}

/// Channel holding the most negative value; the first one on ties.
pub fn peak_channel(template: &[f32]) -> usize {
    template
        .iter()
        .enumerate()
        .fold((0, f32::INFINITY), |best, (i, &v)| if v < best.1 { (i, v) } else { best })
        .0
}

/// Stable-sorts templates by their peak channel's x and remaps labels to match.
pub fn sort_by_peak_x(
    templates: Vec<Vec<f32>>,
    labels: &[usize],
    geometry: &ElectrodeGeometry,
) -> (Vec<Vec<f32>>, Vec<usize>) {
    let mut order: Vec<usize> = (0..templates.len()).collect();
    order.sort_by(|&a, &b| {
        let xa = geometry.x(peak_channel(&templates[a]));
        let xb = geometry.x(peak_channel(&templates[b]));
        xa.total_cmp(&xb)
    });

    let mut new_label = vec![NOISE_LABEL; templates.len() + 1];
    for (position, &old) in order.iter().enumerate() {
        new_label[old + 1] = position + 1;
    }
    let labels = labels.iter().map(|&l| new_label[l]).collect();
    let sorted = order.into_iter().map(|i| templates[i].clone()).collect();
    (sorted, labels)
}

/// Full coarse sorting pass over one shifted chunk.
pub fn coarse_sort(
    chunk: &ChunkMatrix,
    intervals: &[Interval],
    geometry: &ElectrodeGeometry,
    fs: f64,
    config: &CoarseSortingConfig,
    window_size: usize,
) -> CoarseSorting {
    let blanked = blank_intervals(chunk, intervals, fs);
    let detector = LocalMinimumDetector::new(config.detect_threshold, window_size);
    let spike_frames = detector.detect(&min_channel_trace(&blanked));
    if spike_frames.is_empty() {
        return CoarseSorting::default();
    }

    let frames: Vec<Vec<f64>> = spike_frames
        .iter()
        .map(|&f| blanked.frame(f).iter().map(|&v| v as f64).collect())
        .collect();
    let amplitudes = frames
        .iter()
        .map(|f| -f.iter().copied().fold(f64::INFINITY, f64::min))
        .collect();
    let spike_times_sec = spike_frames.iter().map(|&f| f as f64 / fs).collect();

    let features = match config.denoise_neighbors {
        Some(k) => denoise(&frames, k),
        None => frames.clone(),
    };
    let clustering = clustering_for(&config.strategy);
    let (labels, count) = compact_labels(&clustering.cluster(&features));
    let templates = compute_templates(&frames, &labels, count, config.template_statistic);
    let (templates, labels) = sort_by_peak_x(templates, &labels, geometry);

    CoarseSorting {
        templates,
        labels,
        spike_frames,
        spike_times_sec,
        amplitudes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(xs: &[f64]) -> ElectrodeGeometry {
        ElectrodeGeometry::new(xs.iter().map(|&x| (x, 0.0)).collect())
    }

    #[test]
    fn blanking_clips_to_chunk() {
        let chunk = ChunkMatrix::from_channels(&[vec![1; 10], vec![2; 10]]);
        let out = blank_intervals(
            &chunk,
            &[Interval {
                start_sec: 0.25,
                end_sec: 5.0,
            }],
            10.0,
        );
        assert_eq!(out.channel(0), vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn labels_are_compacted() {
        let (labels, count) = compact_labels(&[5, 0, 2, 5, 9]);
        assert_eq!(labels, vec![2, 0, 1, 2, 3]);
        assert_eq!(count, 3);
    }

    #[test]
    fn median_template_even_and_odd() {
        let frames = vec![vec![1.0, -3.0], vec![3.0, -1.0], vec![10.0, 0.0], vec![7.0, 7.0]];
        let t = compute_templates(&frames, &[1, 1, 1, 2], 2, TemplateStatistic::Median);
        assert_eq!(t, vec![vec![3.0, -1.0], vec![7.0, 7.0]]);
        let m = compute_templates(&frames, &[1, 1, 0, 1], 1, TemplateStatistic::Mean);
        assert_eq!(m, vec![vec![11.0 / 3.0, 1.0]]);
    }

    #[test]
    fn sort_is_stable_and_remaps() {
        let geo = geometry(&[30.0, 10.0, 10.0]);
        let templates = vec![
            vec![-50.0, 0.0, 0.0], // peak x 30
            vec![0.0, -40.0, 0.0], // peak x 10
            vec![0.0, 0.0, -60.0], // peak x 10
        ];
        let (sorted, labels) = sort_by_peak_x(templates, &[1, 2, 3, 0], &geo);
        assert_eq!(peak_channel(&sorted[0]), 1);
        assert_eq!(peak_channel(&sorted[1]), 2);
        assert_eq!(peak_channel(&sorted[2]), 0);
        assert_eq!(labels, vec![3, 1, 2, 0]);
    }

    #[test]
    fn denoise_averages_nearest() {
        let points = vec![vec![0.0], vec![2.0], vec![100.0]];
        let out = denoise(&points, 2);
        assert_eq!(out, vec![vec![1.0], vec![1.0], vec![51.0]]);
    }

    fn two_unit_chunk() -> (ChunkMatrix, ElectrodeGeometry) {
        let frames = 2000;
        let mut traces = vec![vec![0i16; frames]; 4];
        // Unit A peaks on channel 3 (x = 0), unit B on channel 0 (x = 300).
        for t in (100..frames - 20).step_by(100) {
            if (t / 100) % 2 == 0 {
                traces[3][t] = -150;
                traces[2][t] = -60;
            } else {
                traces[0][t] = -200;
                traces[1][t] = -90;
            }
        }
        let chunk = ChunkMatrix::from_channels(&traces);
        (chunk, geometry(&[300.0, 200.0, 100.0, 0.0]))
    }

    #[test]
    fn coarse_sort_two_units() {
        let (chunk, geo) = two_unit_chunk();
        let mut config = CoarseSortingConfig::default();
        config.strategy = ClusteringStrategy::Kmeans {
            num_clusters: 2,
            n_init: 4,
            max_iterations: 50,
            seed: 3,
        };
        let result = coarse_sort(&chunk, &[], &geo, 1000.0, &config, 10);

        assert_eq!(result.templates.len(), 2);
        let xs: Vec<f64> = result
            .templates
            .iter()
            .map(|t| geo.x(peak_channel(t)))
            .collect();
        assert!(xs.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(result.templates[0][3], -150.0);
        assert_eq!(result.templates[1][0], -200.0);

        assert_eq!(result.labels.len(), result.spike_times_sec.len());
        for (frame, (&label, &amp)) in result
            .spike_frames
            .iter()
            .zip(result.labels.iter().zip(&result.amplitudes))
        {
            if (frame / 100) % 2 == 0 {
                assert_eq!((label, amp), (1, 150.0));
            } else {
                assert_eq!((label, amp), (2, 200.0));
            }
        }
        assert_eq!(result.spike_times_sec[0], 0.1);
    }

    #[test]
    fn blanked_spikes_and_silence_give_empty_result() {
        let (chunk, geo) = two_unit_chunk();
        let everything = Interval {
            start_sec: 0.0,
            end_sec: 2.0,
        };
        let result = coarse_sort(&chunk, &[everything], &geo, 1000.0, &CoarseSortingConfig::default(), 10);
        assert!(result.templates.is_empty());
        assert!(result.labels.is_empty());
        assert!(result.flat_templates().is_empty());
    }

    #[test]
    fn density_strategy_keeps_noise_label() {
        let (chunk, geo) = two_unit_chunk();
        let mut traces: Vec<Vec<i16>> = (0..4).map(|c| chunk.channel(c).iter().map(|&v| v as i16).collect()).collect();
        // One odd spike far from both units.
        traces[1][1950] = -500;
        let chunk = ChunkMatrix::from_channels(&traces);
        let mut config = CoarseSortingConfig::default();
        config.strategy = ClusteringStrategy::Density {
            eps: 5.0,
            min_points: 3,
        };
        let result = coarse_sort(&chunk, &[], &geo, 1000.0, &config, 10);
        assert_eq!(result.templates.len(), 2);
        assert_eq!(*result.labels.last().unwrap(), NOISE_LABEL);
    }
}
