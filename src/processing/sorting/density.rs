use rayon::prelude::*;

use super::{squared_distance, ClusteringInstance, NOISE_LABEL};

/// DBSCAN. Points that are neither core nor reachable from a core point keep
/// the noise label.
pub struct Dbscan {
    pub eps: f64,
    pub min_points: usize,
}

impl Dbscan {
    pub fn new(eps: f64, min_points: usize) -> Self {
        Self { eps, min_points }
    }

    fn neighbourhoods(&self, points: &[Vec<f64>]) -> Vec<Vec<usize>> {
        let eps2 = self.eps * self.eps;
        points
            .par_iter()
            .map(|p| {
                points
                    .iter()
                    .enumerate()
                    .filter(|(_, q)| squared_distance(p, q) <= eps2)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect()
    }
}

impl ClusteringInstance for Dbscan {
    fn id(&self) -> &str {
        "density"
    }

    fn cluster(&self, points: &[Vec<f64>]) -> Vec<usize> {
        let neighbours = self.neighbourhoods(points);
        let is_core: Vec<bool> = neighbours.iter().map(|n| n.len() >= self.min_points).collect();

        let mut labels = vec![NOISE_LABEL; points.len()];
        let mut next_label = 0;
        for seed in 0..points.len() {
            if labels[seed] != NOISE_LABEL || !is_core[seed] {
                continue;
            }
            next_label += 1;
            labels[seed] = next_label;
            let mut frontier = vec![seed];
            while let Some(p) = frontier.pop() {
                if !is_core[p] {
                    continue;
                }
                for &q in &neighbours[p] {
                    if labels[q] == NOISE_LABEL {
                        labels[q] = next_label;
                        frontier.push(q);
                    }
                }
            }
        }
        labels
    }
}
