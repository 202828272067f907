use std::fs;
use std::path::PathBuf;

use tracing::info;

use super::export::{ArtifactWriter, DirectoryArtifactWriter, PreviewBundle};
use super::{SizeRule, StageContext, StageInstance};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::processing::detectors::high_activity::{detect_high_activity, HighActivityIntervals};
use crate::processing::detectors::spike_stats::{compute_spike_stats, SpikeStats};
use crate::processing::filters::bandpass::{BandPassFilter, BandPassFilterConfig};
use crate::processing::filters::filter_chunk;
use crate::processing::shifts::{apply_shifts, estimate, ShiftCoefficients};
use crate::processing::sorting::coarse_sort;
use crate::store::{
    atomic::atomic_write_dir, atomic_write_bytes, atomic_write_json, encode_f32, read_chunk,
    read_frame_range, write_chunk, RawChunk,
};

/// Filter → Shift-Estimate → Shift-Apply → Activity-Detect → Spike-Stats →
/// Coarse-Template → Artifact-Export.
pub fn default_stages(config: &Config) -> Vec<Box<dyn StageInstance>> {
    vec![
        Box::new(FilterStage::new(config)),
        Box::new(ShiftEstimateStage),
        Box::new(ShiftApplyStage),
        Box::new(ActivityDetectStage),
        Box::new(SpikeStatsStage),
        Box::new(CoarseTemplateStage),
        Box::new(ArtifactExportStage::new(Box::new(DirectoryArtifactWriter))),
    ]
}

fn file_len(path: &std::path::Path) -> PipelineResult<u64> {
    Ok(fs::metadata(path)?.len())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> PipelineResult<T> {
    serde_json::from_slice(&fs::read(path)?).map_err(|e| PipelineError::UnreadableArtifact {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// FILTER ----------------------------------------------------------------------

pub struct FilterStage {
    filter: BandPassFilter,
}

impl FilterStage {
    pub fn new(config: &Config) -> Self {
        let filter_config = BandPassFilterConfig::from_params(&config.filter_params);
        Self {
            filter: BandPassFilter::new(filter_config, config.sampling_frequency),
        }
    }
}

impl StageInstance for FilterStage {
    fn id(&self) -> &str {
        "filter"
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.filt_path(&chunk.name)
    }

    fn inputs(&self, chunk: &RawChunk, _ctx: &StageContext) -> Vec<PathBuf> {
        vec![chunk.path.clone()]
    }

    fn size_rule(&self, chunk: &RawChunk, _ctx: &StageContext) -> PipelineResult<Option<SizeRule>> {
        Ok(Some(SizeRule::Exact(file_len(&chunk.path)?)))
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let raw = read_chunk(&chunk.path, ctx.config.n_channels)?;
        let filtered = filter_chunk(&self.filter, &raw, ctx.workers);
        write_chunk(&self.output_path(chunk, ctx), &filtered)
    }
}

// SHIFT ESTIMATE --------------------------------------------------------------

/// Runs once per experiment, on the newest chunk with a filtered artifact.
pub struct ShiftEstimateStage;

impl StageInstance for ShiftEstimateStage {
    fn id(&self) -> &str {
        "shift_estimate"
    }

    fn is_global(&self) -> bool {
        true
    }

    fn output_path(&self, _chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.shift_coeffs_path()
    }

    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.layout.filt_path(&chunk.name)]
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let fs = ctx.config.sampling_frequency;
        let settings = &ctx.config.shift_estimation;
        let needed = (settings.coarse_duration_sec.max(settings.refine_duration_sec) * fs) as u64;
        let head = read_frame_range(
            &ctx.layout.filt_path(&chunk.name),
            ctx.config.n_channels,
            0,
            needed,
        )?;

        let coefficients = estimate(&head, ctx.geometry, fs, settings, &chunk.name);
        info!(
            c_x = coefficients.c_x,
            c_y = coefficients.c_y,
            converged = coefficients.converged,
            source = %chunk.name,
            "shift coefficients estimated"
        );
        coefficients.save(&self.output_path(chunk, ctx))
    }
}

// SHIFT APPLY -----------------------------------------------------------------

pub struct ShiftApplyStage;

impl StageInstance for ShiftApplyStage {
    fn id(&self) -> &str {
        "shift_apply"
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.shifted_path(&chunk.name)
    }

    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.layout.filt_path(&chunk.name), ctx.layout.shift_coeffs_path()]
    }

    fn size_rule(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<Option<SizeRule>> {
        let filt = ctx.layout.filt_path(&chunk.name);
        if !filt.exists() {
            return Ok(None);
        }
        Ok(Some(SizeRule::Exact(file_len(&filt)?)))
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let loaded;
        let coefficients = match ctx.shift_coefficients {
            Some(c) => c,
            None => {
                let path = ctx.layout.shift_coeffs_path();
                loaded = ShiftCoefficients::load(&path)?.ok_or(PipelineError::MissingArtifact(path))?;
                &loaded
            }
        };
        let filtered = read_chunk(&ctx.layout.filt_path(&chunk.name), ctx.config.n_channels)?;
        let shifts = coefficients.shifts(ctx.geometry, ctx.config.sampling_frequency);
        let shifted = apply_shifts(&filtered, &shifts);
        write_chunk(&self.output_path(chunk, ctx), &shifted)
    }
}

// ACTIVITY DETECT -------------------------------------------------------------

pub struct ActivityDetectStage;

impl StageInstance for ActivityDetectStage {
    fn id(&self) -> &str {
        "activity_detect"
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.high_activity_path(&chunk.name)
    }

    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.layout.filt_path(&chunk.name)]
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let filtered = read_chunk(&ctx.layout.filt_path(&chunk.name), ctx.config.n_channels)?;
        let intervals = detect_high_activity(
            &filtered,
            ctx.config.sampling_frequency,
            ctx.config.high_activity_threshold,
            &ctx.config.high_activity,
        );
        info!(
            chunk = %chunk.name,
            intervals = intervals.high_activity_intervals.len(),
            flagged_sec = intervals.total_duration(),
            "high activity detected"
        );
        atomic_write_json(&self.output_path(chunk, ctx), &intervals)
    }
}

// SPIKE STATS -----------------------------------------------------------------

pub struct SpikeStatsStage;

impl StageInstance for SpikeStatsStage {
    fn id(&self) -> &str {
        "spike_stats"
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.stats_path(&chunk.name)
    }

    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
        vec![ctx.layout.filt_path(&chunk.name)]
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let filtered = read_chunk(&ctx.layout.filt_path(&chunk.name), ctx.config.n_channels)?;
        let stats = compute_spike_stats(
            &filtered,
            ctx.config.sampling_frequency,
            ctx.config.detect_threshold_for_spike_stats,
            ctx.config.spike_detection.window_size,
        );
        atomic_write_json(&self.output_path(chunk, ctx), &stats)
    }
}

// COARSE TEMPLATE -------------------------------------------------------------

pub struct CoarseTemplateStage;

impl StageInstance for CoarseTemplateStage {
    fn id(&self) -> &str {
        "coarse_template"
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.templates_path(&chunk.name)
    }

    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
        vec![
            ctx.layout.shifted_path(&chunk.name),
            ctx.layout.high_activity_path(&chunk.name),
        ]
    }

    fn size_rule(&self, _chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<Option<SizeRule>> {
        Ok(Some(SizeRule::MultipleOf(4 * ctx.config.n_channels as u64)))
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let shifted = read_chunk(&ctx.layout.shifted_path(&chunk.name), ctx.config.n_channels)?;
        let intervals: HighActivityIntervals = read_json(&ctx.layout.high_activity_path(&chunk.name))?;

        let sorting = coarse_sort(
            &shifted,
            &intervals.high_activity_intervals,
            ctx.geometry,
            ctx.config.sampling_frequency,
            &ctx.config.coarse_sorting,
            ctx.config.spike_detection.window_size,
        );
        info!(
            chunk = %chunk.name,
            spikes = sorting.labels.len(),
            templates = sorting.templates.len(),
            "coarse sorting finished"
        );

        // The sidecar lands first so the templates file stays the completion marker.
        atomic_write_json(&ctx.layout.spikes_path(&chunk.name), &sorting.sidecar())?;
        atomic_write_bytes(&self.output_path(chunk, ctx), &encode_f32(&sorting.flat_templates()))
    }
}

// ARTIFACT EXPORT -------------------------------------------------------------

pub struct ArtifactExportStage {
    writer: Box<dyn ArtifactWriter>,
}

impl ArtifactExportStage {
    pub fn new(writer: Box<dyn ArtifactWriter>) -> Self {
        Self { writer }
    }
}

impl StageInstance for ArtifactExportStage {
    fn id(&self) -> &str {
        "artifact_export"
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
        ctx.layout.preview_path(&chunk.name)
    }

    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
        let layout = ctx.layout;
        vec![
            layout.filt_path(&chunk.name),
            layout.shifted_path(&chunk.name),
            layout.high_activity_path(&chunk.name),
            layout.stats_path(&chunk.name),
            layout.templates_path(&chunk.name),
        ]
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        let layout = ctx.layout;
        let n_channels = ctx.config.n_channels;
        let filtered = read_chunk(&layout.filt_path(&chunk.name), n_channels)?;
        let stats: SpikeStats = read_json(&layout.stats_path(&chunk.name))?;
        let high_activity: HighActivityIntervals = read_json(&layout.high_activity_path(&chunk.name))?;
        let templates = crate::store::decode_f32(&fs::read(layout.templates_path(&chunk.name))?);

        let bundle = PreviewBundle {
            chunk: &chunk.name,
            sampling_frequency: ctx.config.sampling_frequency,
            geometry: ctx.geometry,
            filtered: &filtered,
            stats: &stats,
            high_activity: &high_activity,
            num_templates: templates.len() / n_channels.max(1),
            templates: &templates,
        };
        atomic_write_dir(&self.output_path(chunk, ctx), |staging| {
            self.writer.write(&bundle, staging)
        })
    }
}
