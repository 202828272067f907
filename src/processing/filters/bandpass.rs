use super::{sosfiltfilt, FilterInstance, SosSection};
use crate::config::FilterParams;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BandPassFilterConfig {
    pub id: String,
    pub f_low: f64,
    pub f_high: f64,
    pub order: usize,
}

impl BandPassFilterConfig {
    pub fn from_params(params: &FilterParams) -> Self {
        Self {
            id: "bandpass".to_string(),
            f_low: params.lowcut,
            f_high: params.highcut,
            order: params.order,
        }
    }
}

/// Zero-phase Butterworth band-pass built from second-order sections.
pub struct BandPassFilter {
    config: BandPassFilterConfig,
    sections: Vec<SosSection>,
}

impl BandPassFilter {
    pub fn new(config: BandPassFilterConfig, fs: f64) -> Self {
        let sections = butter_bandpass_sos(config.order, config.f_low, config.f_high, fs);
        BandPassFilter { config, sections }
    }

    pub fn sections(&self) -> &[SosSection] {
        &self.sections
    }
}

impl FilterInstance for BandPassFilter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn filter_trace(&self, trace: &[f64]) -> Vec<f64> {
        sosfiltfilt(&self.sections, trace)
    }
}

// DESIGN ----------------------------------------------------------------------

/// Digital Butterworth band-pass of the given order as `order` biquads.
///
/// Analog low-pass prototype, low-pass to band-pass transform around the
/// pre-warped edges, then the bilinear transform. Poles are paired with their
/// conjugates and the sections ordered so the poles nearest the unit circle come
/// last; every section carries one zero at `z = 1` and one at `z = -1`, and the
/// overall gain sits on the first section.
pub fn butter_bandpass_sos(order: usize, f_low: f64, f_high: f64, fs: f64) -> Vec<SosSection> {
    let n = order as i32;
    let fs2 = 2.0 * fs;

    // Pre-warped analog edges.
    let wl = fs2 * (PI * f_low / fs).tan();
    let wh = fs2 * (PI * f_high / fs).tan();
    let bw = wh - wl;
    let wo2 = wl * wh;

    // Prototype poles on the left half of the unit circle.
    let prototype: Vec<Complex64> = (0..n)
        .map(|k| {
            let m = (-n + 1 + 2 * k) as f64;
            -Complex64::from_polar(1.0, PI * m / (2.0 * n as f64))
        })
        .collect();

    let mut analog = Vec::with_capacity(2 * order);
    for p in &prototype {
        let p_lp = *p * (bw / 2.0);
        let root = (p_lp * p_lp - wo2).sqrt();
        analog.push(p_lp + root);
        analog.push(p_lp - root);
    }

    let fs2c = Complex64::new(fs2, 0.0);
    let digital: Vec<Complex64> = analog.iter().map(|p| (fs2c + *p) / (fs2c - *p)).collect();

    // k = bw^n · fs2^n / prod(fs2 - p)
    let denom = analog
        .iter()
        .fold(Complex64::new(1.0, 0.0), |acc, p| acc * (fs2c - *p));
    let gain = (Complex64::new((bw * fs2).powi(n), 0.0) / denom).re;

    // Conjugate pairs contribute one pole each; real poles are paired with each other.
    let mut complex = Vec::new();
    let mut real = Vec::new();
    for p in digital {
        if p.im.abs() <= 1e-10 * p.norm().max(1.0) {
            real.push(p.re);
        } else if p.im > 0.0 {
            complex.push(p);
        }
    }
    real.sort_by(|a, b| (1.0 - b.abs()).abs().total_cmp(&(1.0 - a.abs()).abs()));

    let mut denominators: Vec<([f64; 3], f64)> = complex
        .iter()
        .map(|p| ([1.0, -2.0 * p.re, p.norm_sqr()], (1.0 - p.norm()).abs()))
        .collect();
    for pair in real.chunks(2) {
        let (p1, p2) = (pair[0], pair.get(1).copied().unwrap_or(0.0));
        let dist = (1.0 - p1.abs()).abs().min((1.0 - p2.abs()).abs());
        denominators.push(([1.0, -(p1 + p2), p1 * p2], dist));
    }
    // Farthest from the unit circle first.
    denominators.sort_by(|a, b| b.1.total_cmp(&a.1));

    denominators
        .into_iter()
        .enumerate()
        .map(|(i, (a, _))| {
            let g = if i == 0 { gain } else { 1.0 };
            SosSection { b: [g, 0.0, -g], a }
        })
        .collect()
}

/// Magnitude of the cascade's response at `freq` Hz.
pub fn magnitude_response(sections: &[SosSection], freq: f64, fs: f64) -> f64 {
    let z = Complex64::from_polar(1.0, 2.0 * PI * freq / fs);
    let z1 = z.inv();
    let z2 = z1 * z1;
    sections
        .iter()
        .map(|s| {
            let num = s.b[0] + z1 * s.b[1] + z2 * s.b[2];
            let den = s.a[0] + z1 * s.a[1] + z2 * s.a[2];
            (num / den).norm()
        })
        .product()
}
