//! Preview export: a sink trait for per-chunk visual bundles plus a plain
//! directory writer.

use std::fs;
use std::path::Path;

use chrono::Utc;
use serde_json::json;

use crate::config::ElectrodeGeometry;
use crate::error::PipelineResult;
use crate::processing::detectors::high_activity::HighActivityIntervals;
use crate::processing::detectors::spike_stats::SpikeStats;
use crate::store::{encode_f32, ChunkMatrix};

/// Maximum number of filtered channels copied into a preview.
pub const PREVIEW_CHANNELS: usize = 64;

pub struct PreviewBundle<'a> {
    pub chunk: &'a str,
    pub sampling_frequency: f64,
    pub geometry: &'a ElectrodeGeometry,
    pub filtered: &'a ChunkMatrix,
    pub stats: &'a SpikeStats,
    pub high_activity: &'a HighActivityIntervals,
    /// Flat `num_templates × n_channels` matrix.
    pub templates: &'a [f32],
    pub num_templates: usize,
}

pub trait ArtifactWriter: Send + Sync {
    fn id(&self) -> &str;
    /// Writes the bundle's files into `staging_dir`, which is renamed into
    /// place by the caller once this returns.
    fn write(&self, bundle: &PreviewBundle, staging_dir: &Path) -> PipelineResult<()>;
}

#[derive(Debug, Default, Clone)]
pub struct DirectoryArtifactWriter;

impl DirectoryArtifactWriter {
    fn preview_matrix(filtered: &ChunkMatrix) -> ChunkMatrix {
        let keep = filtered.channels.min(PREVIEW_CHANNELS);
        let mut samples = Vec::with_capacity(filtered.frames * keep);
        for f in 0..filtered.frames {
            samples.extend_from_slice(&filtered.frame(f)[..keep]);
        }
        ChunkMatrix::new(filtered.frames, keep, samples)
    }
}

impl ArtifactWriter for DirectoryArtifactWriter {
    fn id(&self) -> &str {
        "directory"
    }

    fn write(&self, bundle: &PreviewBundle, staging_dir: &Path) -> PipelineResult<()> {
        let preview = Self::preview_matrix(bundle.filtered);
        fs::write(staging_dir.join("templates.f32"), encode_f32(bundle.templates))?;
        fs::write(staging_dir.join("filt_preview.i16"), preview.to_le_bytes())?;

        let index = json!({
            "chunk": bundle.chunk,
            "generated_at": Utc::now().to_rfc3339(),
            "sampling_frequency": bundle.sampling_frequency,
            "n_channels": bundle.filtered.channels,
            "num_frames": bundle.filtered.frames,
            "electrode_coords": bundle.geometry.coords,
            "spike_stats": bundle.stats,
            "high_activity": bundle.high_activity,
            "num_templates": bundle.num_templates,
            "preview_channels": preview.channels,
            "files": {
                "templates": "templates.f32",
                "filt_preview": "filt_preview.i16",
            },
        });
        fs::write(staging_dir.join("index.json"), serde_json::to_vec_pretty(&index)?)?;
        Ok(())
    }
}
