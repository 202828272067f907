use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};

pub const ELECTRODE_FILE_NAME: &str = "electrode_coords.txt";

/// Ordered electrode positions, one per channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElectrodeGeometry {
    pub coords: Vec<(f64, f64)>,
}

impl ElectrodeGeometry {
    pub fn new(coords: Vec<(f64, f64)>) -> Self {
        Self { coords }
    }

    /// Parses `X Y` pairs; lines that are not exactly two numbers are skipped.
    pub fn parse(text: &str) -> Self {
        let mut coords = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parts: Vec<&str> = trimmed.split_whitespace().collect();
            if parts.len() != 2 {
                warn!(line = line_no + 1, "skipping electrode line without two fields");
                continue;
            }
            match (parts[0].parse::<f64>(), parts[1].parse::<f64>()) {
                (Ok(x), Ok(y)) => coords.push((x, y)),
                _ => warn!(line = line_no + 1, "skipping non-numeric electrode line"),
            }
        }
        Self { coords }
    }

    /// Loads the geometry and checks it against the configured channel count.
    pub fn load<P: AsRef<Path>>(path: P, n_channels: usize) -> PipelineResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let geometry = Self::parse(&text);
        if geometry.len() != n_channels {
            return Err(PipelineError::Geometry {
                expected: n_channels,
                found: geometry.len(),
            });
        }
        Ok(geometry)
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn x(&self, channel: usize) -> f64 {
        self.coords[channel].0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_lines_are_skipped() {
        let geometry = ElectrodeGeometry::parse("0 0\n10 0\n# comment\n20 abc\n\n30 5 1\n40.5 2.5\n");
        assert_eq!(geometry.coords, vec![(0.0, 0.0), (10.0, 0.0), (40.5, 2.5)]);
    }

    #[test]
    fn count_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ELECTRODE_FILE_NAME);
        fs::write(&path, "0 0\n1 1\n").unwrap();
        let err = ElectrodeGeometry::load(&path, 3).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Geometry {
                expected: 3,
                found: 2
            }
        ));
        assert_eq!(ElectrodeGeometry::load(&path, 2).unwrap().len(), 2);
    }
}
