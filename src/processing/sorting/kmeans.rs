use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::{squared_distance, ClusteringInstance};

#[derive(Debug, Clone)]
pub struct KMeansConfig {
    pub num_clusters: usize,
    pub n_init: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

pub struct KMeans {
    config: KMeansConfig,
}

struct Fit {
    assignments: Vec<usize>,
    inertia: f64,
}

impl KMeans {
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    fn seed_centroids(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
        let mut centroids = Vec::with_capacity(k);
        centroids.push(points[rng.gen_range(0..points.len())].clone());

        let mut d2: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &centroids[0]))
            .collect();
        while centroids.len() < k {
            let total: f64 = d2.iter().sum();
            let next = if total > 0.0 {
                let mut target = rng.gen::<f64>() * total;
                let mut chosen = points.len() - 1;
                for (i, w) in d2.iter().enumerate() {
                    if target < *w {
                        chosen = i;
                        break;
                    }
                    target -= w;
                }
                chosen
            } else {
                rng.gen_range(0..points.len())
            };
            let centroid = points[next].clone();
            for (d, p) in d2.iter_mut().zip(points) {
                *d = d.min(squared_distance(p, &centroid));
            }
            centroids.push(centroid);
        }
        centroids
    }

    fn assign(points: &[Vec<f64>], centroids: &[Vec<f64>]) -> Vec<(usize, f64)> {
        points
            .par_iter()
            .map(|p| {
                centroids
                    .iter()
                    .enumerate()
                    .map(|(c, centroid)| (c, squared_distance(p, centroid)))
                    .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
            })
            .collect()
    }

    fn fit_once(&self, points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Fit {
        let dims = points[0].len();
        let mut centroids = Self::seed_centroids(points, k, rng);
        let mut assignments: Vec<usize> = Vec::new();
        let mut inertia = f64::INFINITY;

        for _ in 0..self.config.max_iterations.max(1) {
            let assigned = Self::assign(points, &centroids);
            let next: Vec<usize> = assigned.iter().map(|a| a.0).collect();
            inertia = assigned.iter().map(|a| a.1).sum();
            if next == assignments {
                break;
            }
            assignments = next;

            let mut sums = vec![vec![0.0; dims]; k];
            let mut counts = vec![0usize; k];
            for (p, &c) in points.iter().zip(&assignments) {
                counts[c] += 1;
                for (s, v) in sums[c].iter_mut().zip(p) {
                    *s += v;
                }
            }
            for c in 0..k {
                // Empty clusters keep their previous centroid.
                if counts[c] > 0 {
                    centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
                }
            }
        }

        Fit {
            assignments,
            inertia,
        }
    }
}

impl ClusteringInstance for KMeans {
    fn id(&self) -> &str {
        "kmeans"
    }

    fn cluster(&self, points: &[Vec<f64>]) -> Vec<usize> {
        if points.is_empty() {
            return Vec::new();
        }
        let k = self.config.num_clusters.min(points.len()).max(1);

        let mut best: Option<Fit> = None;
        for restart in 0..self.config.n_init.max(1) {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(restart as u64));
            let fit = self.fit_once(points, k, &mut rng);
            if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }
        best.map(|fit| fit.assignments.into_iter().map(|c| c + 1).collect())
            .unwrap_or_default()
    }
}
