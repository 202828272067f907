pub mod bandpass;

use rayon::prelude::*;

use crate::store::ChunkMatrix;

pub trait FilterInstance: Send + Sync {
    fn id(&self) -> &str;
    /// Filters a whole single-channel trace.
    fn filter_trace(&self, trace: &[f64]) -> Vec<f64>;
}

// SECOND ORDER SECTION --------------------------------------------------------

/// One biquad, normalised so that `a[0] == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SosSection {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl SosSection {
    /// Steady-state of the transposed direct-form II state for a unit step input.
    pub fn lfilter_zi(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let rhs0 = b1 - a1 * b0;
        let rhs1 = b2 - a2 * b0;
        let denom = 1.0 + a1 + a2;
        if denom.abs() < f64::EPSILON {
            return [0.0, 0.0];
        }
        let z0 = (rhs0 + rhs1) / denom;
        [z0, rhs1 - a2 * z0]
    }

    fn dc_gain(&self) -> f64 {
        let den: f64 = self.a.iter().sum();
        if den.abs() < f64::EPSILON {
            return 0.0;
        }
        self.b.iter().sum::<f64>() / den
    }

    #[inline]
    fn step(&self, x: f64, z: &mut [f64; 2]) -> f64 {
        let y = self.b[0] * x + z[0];
        z[0] = self.b[1] * x - self.a[1] * y + z[1];
        z[1] = self.b[2] * x - self.a[2] * y;
        y
    }
}

/// Initial conditions of a cascade for a unit step, each section scaled by the
/// DC gain of the sections before it.
pub fn sosfilt_zi(sections: &[SosSection]) -> Vec<[f64; 2]> {
    let mut scale = 1.0;
    sections
        .iter()
        .map(|s| {
            let zi = s.lfilter_zi();
            let scaled = [zi[0] * scale, zi[1] * scale];
            scale *= s.dc_gain();
            scaled
        })
        .collect()
}

/// Runs the cascade over `x` in place starting from state `zi`.
pub fn sosfilt(sections: &[SosSection], x: &mut [f64], mut zi: Vec<[f64; 2]>) {
    for v in x.iter_mut() {
        let mut acc = *v;
        for (section, z) in sections.iter().zip(zi.iter_mut()) {
            acc = section.step(acc, z);
        }
        *v = acc;
    }
}

/// Forward-backward filtering with odd extension, as in the conventional `sosfiltfilt`.
pub fn sosfiltfilt(sections: &[SosSection], x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n == 0 || sections.is_empty() {
        return x.to_vec();
    }
    let padlen = 3 * (2 * sections.len() + 1);
    let edge = padlen.min(n - 1);

    let first = x[0];
    let last = x[n - 1];
    let mut ext = Vec::with_capacity(n + 2 * edge);
    ext.extend((0..edge).map(|i| 2.0 * first - x[edge - i]));
    ext.extend_from_slice(x);
    ext.extend((0..edge).map(|i| 2.0 * last - x[n - 2 - i]));

    let zi = sosfilt_zi(sections);
    let scaled = |z: &[[f64; 2]], by: f64| -> Vec<[f64; 2]> {
        z.iter().map(|s| [s[0] * by, s[1] * by]).collect()
    };

    let x0 = ext[0];
    sosfilt(sections, &mut ext, scaled(&zi, x0));
    ext.reverse();
    let y0 = ext[0];
    sosfilt(sections, &mut ext, scaled(&zi, y0));
    ext.reverse();

    ext[edge..edge + n].to_vec()
}

#[inline]
pub fn saturate_i16(v: f64) -> i16 {
    v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Filters every channel of `chunk`, splitting the channel axis into `groups`
/// contiguous blocks processed in parallel on the current rayon pool.
pub fn filter_chunk(filter: &dyn FilterInstance, chunk: &ChunkMatrix, groups: usize) -> ChunkMatrix {
    let channels = chunk.channels;
    if channels == 0 || chunk.frames == 0 {
        return chunk.clone();
    }
    let groups = groups.clamp(1, channels);
    let per_group = (channels + groups - 1) / groups;

    let ranges: Vec<(usize, usize)> = (0..channels)
        .step_by(per_group)
        .map(|start| (start, (start + per_group).min(channels)))
        .collect();

    let traces: Vec<Vec<i16>> = ranges
        .par_iter()
        .map(|&(start, end)| {
            (start..end)
                .map(|ch| {
                    filter
                        .filter_trace(&chunk.channel(ch))
                        .into_iter()
                        .map(saturate_i16)
                        .collect::<Vec<i16>>()
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();

    ChunkMatrix::from_channels(&traces)
}
