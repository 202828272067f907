pub mod export;
pub mod runner;
pub mod stages;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{Config, ElectrodeGeometry, ReprocessPolicy};
use crate::error::{PipelineError, PipelineResult};
use crate::processing::shifts::ShiftCoefficients;
use crate::store::{ExperimentLayout, RawChunk};

// -----------------------------------------------------------------------------
// STAGE INTERFACE
// -----------------------------------------------------------------------------

/// Everything a stage may read during one invocation.
pub struct StageContext<'a> {
    pub layout: &'a ExperimentLayout,
    pub config: &'a Config,
    pub geometry: &'a ElectrodeGeometry,
    /// Loaded from disk at the start of the cycle; `None` until estimated.
    pub shift_coefficients: Option<&'a ShiftCoefficients>,
    pub workers: usize,
}

/// What a finished artifact's byte length must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    Exact(u64),
    MultipleOf(u64),
}

impl SizeRule {
    pub fn accepts(&self, len: u64) -> bool {
        match *self {
            SizeRule::Exact(expected) => len == expected,
            SizeRule::MultipleOf(unit) => unit != 0 && len % unit == 0,
        }
    }

    fn expected(&self) -> u64 {
        match *self {
            SizeRule::Exact(expected) | SizeRule::MultipleOf(expected) => expected,
        }
    }
}

pub trait StageInstance: Send + Sync {
    fn id(&self) -> &str;

    /// Experiment-scoped stages produce one artifact for the whole experiment.
    fn is_global(&self) -> bool {
        false
    }

    fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf;

    /// Paths that must all exist before the stage may run for `chunk`.
    fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf>;

    /// Size constraint on the finished artifact, if any.
    fn size_rule(&self, _chunk: &RawChunk, _ctx: &StageContext) -> PipelineResult<Option<SizeRule>> {
        Ok(None)
    }

    fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Ran { stage: String, chunk: String },
    Idle,
}

// -----------------------------------------------------------------------------
// ORCHESTRATOR
// -----------------------------------------------------------------------------

pub struct Orchestrator {
    layout: ExperimentLayout,
    config: Config,
    geometry: ElectrodeGeometry,
    stages: Vec<Box<dyn StageInstance>>,
    pool: rayon::ThreadPool,
    workers: usize,
}

impl Orchestrator {
    pub fn new(layout: ExperimentLayout, config: Config, geometry: ElectrodeGeometry) -> PipelineResult<Self> {
        let workers = config.pipeline.num_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mea-worker-{}", i))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        Ok(Self {
            layout,
            config,
            geometry,
            stages: Vec::new(),
            pool,
            workers,
        })
    }

    /// An orchestrator with the standard stage sequence.
    pub fn with_default_stages(
        layout: ExperimentLayout,
        config: Config,
        geometry: ElectrodeGeometry,
    ) -> PipelineResult<Self> {
        let mut orchestrator = Self::new(layout, config, geometry)?;
        for stage in stages::default_stages(&orchestrator.config) {
            orchestrator.add_stage(stage);
        }
        Ok(orchestrator)
    }

    pub fn add_stage(&mut self, stage: Box<dyn StageInstance>) {
        self.stages.push(stage);
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    pub fn layout(&self) -> &ExperimentLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Chunks eligible for processing, newest first. Raw files with a partial
    /// trailing frame are skipped.
    fn chunks(&self) -> PipelineResult<Vec<RawChunk>> {
        let quiet = Duration::from_secs_f64(self.config.pipeline.quiet_period_sec);
        let frame_bytes = self.config.bytes_per_frame();
        let mut chunks = Vec::new();
        for chunk in self.layout.list_raw_chunks(quiet)? {
            // Vanished since listing: not eligible this cycle.
            let Ok(metadata) = fs::metadata(&chunk.path) else {
                debug!(chunk = %chunk.name, "raw chunk disappeared before it could be inspected");
                continue;
            };
            let len = metadata.len();
            if len % frame_bytes != 0 {
                warn!(chunk = %chunk.name, len, "skipping raw chunk with a partial frame");
                continue;
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Finds and executes at most one stage invocation.
    pub fn run_cycle(&self) -> PipelineResult<CycleOutcome> {
        let chunks = self.chunks()?;
        let coefficients = self.load_coefficients()?;
        let ctx = StageContext {
            layout: &self.layout,
            config: &self.config,
            geometry: &self.geometry,
            shift_coefficients: coefficients.as_ref(),
            workers: self.workers,
        };

        let mut failed: HashSet<&str> = HashSet::new();

        for (index, stage) in self.stages.iter().enumerate() {
            if stage.is_global() && self.global_done(stage.as_ref(), &chunks, &ctx) {
                continue;
            }
            let previous = self.stages[..index].iter().rev().find(|s| !s.is_global());

            for chunk in &chunks {
                if failed.contains(chunk.name.as_str()) {
                    continue;
                }
                let output = stage.output_path(chunk, &ctx);
                if output.exists() && !self.reject_stale(index, chunk, &output, &ctx)? {
                    if stage.is_global() {
                        break;
                    }
                    continue;
                }
                if let Some(prev) = previous {
                    if !prev.output_path(chunk, &ctx).exists() {
                        continue;
                    }
                }
                if !stage.inputs(chunk, &ctx).iter().all(|p| p.exists()) {
                    continue;
                }

                info!(stage = stage.id(), chunk = %chunk.name, "running stage");
                let started = Instant::now();
                if let Err(err) = self.pool.install(|| stage.process(chunk, &ctx)) {
                    self.recover(index, chunk, &ctx, err)?;
                    failed.insert(chunk.name.as_str());
                    continue;
                }
                info!(
                    stage = stage.id(),
                    chunk = %chunk.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "stage finished"
                );
                return Ok(CycleOutcome::Ran {
                    stage: stage.id().to_string(),
                    chunk: chunk.name.clone(),
                });
            }
        }
        debug!(chunks = chunks.len(), "no eligible work");
        Ok(CycleOutcome::Idle)
    }

    fn global_done(&self, stage: &dyn StageInstance, chunks: &[RawChunk], ctx: &StageContext) -> bool {
        chunks
            .first()
            .map_or(true, |c| stage.output_path(c, ctx).exists())
    }

    /// Applies the reprocess policy to an existing artifact. Returns `true` when
    /// the artifact was removed and must be computed again.
    fn reject_stale(
        &self,
        stage_index: usize,
        chunk: &RawChunk,
        output: &Path,
        ctx: &StageContext,
    ) -> PipelineResult<bool> {
        let stage = &self.stages[stage_index];
        let Some(rule) = stage.size_rule(chunk, ctx)? else {
            return Ok(false);
        };
        let found = fs::metadata(output)?.len();
        if rule.accepts(found) {
            return Ok(false);
        }

        let policy = self.config.pipeline.reprocess_policy;
        if policy == ReprocessPolicy::FailFast {
            return Err(PipelineError::ArtifactSizeMismatch {
                path: output.to_path_buf(),
                expected: rule.expected(),
                found,
            });
        }

        warn!(
            stage = stage.id(),
            chunk = %chunk.name,
            expected = rule.expected(),
            found,
            "artifact has the wrong size"
        );
        self.remove_downstream(stage_index, chunk, ctx)?;
        self.discard(output)?;
        Ok(true)
    }

    /// Removes the per-chunk artifacts of every stage after `stage_index`, last
    /// stage first so no artifact outlives its predecessor.
    fn remove_downstream(&self, stage_index: usize, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
        for later in self.stages[stage_index + 1..].iter().rev() {
            if later.is_global() {
                continue;
            }
            let path = later.output_path(chunk, ctx);
            if path.exists() {
                warn!(path = %path.display(), "removing artifact derived from a stale input");
                remove_artifact(&path)?;
            }
        }
        Ok(())
    }

    /// Deletes or quarantines one artifact so its stage computes it again.
    fn discard(&self, artifact: &Path) -> PipelineResult<()> {
        if self.config.pipeline.reprocess_policy == ReprocessPolicy::Quarantine {
            let dest = quarantine_destination(&self.layout, artifact);
            fs::create_dir_all(self.layout.quarantine_dir())?;
            fs::rename(artifact, &dest)?;
            error!(
                artifact = %artifact.display(),
                quarantined = %dest.display(),
                "artifact quarantined; recomputing"
            );
        } else {
            warn!(artifact = %artifact.display(), "artifact deleted; recomputing");
            remove_artifact(artifact)?;
        }
        Ok(())
    }

    /// Handles a failed invocation. An unreadable upstream artifact is
    /// discarded together with everything derived from it, so its producing
    /// stage runs again on a later cycle. Only fail-fast stops the loop.
    fn recover(
        &self,
        stage_index: usize,
        chunk: &RawChunk,
        ctx: &StageContext,
        err: PipelineError,
    ) -> PipelineResult<()> {
        if self.config.pipeline.reprocess_policy == ReprocessPolicy::FailFast {
            return Err(err);
        }
        let stage = &self.stages[stage_index];
        error!(
            stage = stage.id(),
            chunk = %chunk.name,
            error = %err,
            "stage failed; skipping chunk for this cycle"
        );

        let Some(bad) = err.artifact_path() else {
            return Ok(());
        };
        let producer = self.stages[..stage_index]
            .iter()
            .position(|s| s.output_path(chunk, ctx) == bad);
        if let Some(producer) = producer {
            self.remove_downstream(producer, chunk, ctx)?;
            if bad.exists() {
                self.discard(bad)?;
            }
        }
        Ok(())
    }

    /// Shift coefficients for this cycle. An undecodable file is handled like
    /// any other damaged artifact.
    fn load_coefficients(&self) -> PipelineResult<Option<ShiftCoefficients>> {
        let path = self.layout.shift_coeffs_path();
        match ShiftCoefficients::load(&path) {
            Ok(coefficients) => Ok(coefficients),
            Err(err) if self.config.pipeline.reprocess_policy != ReprocessPolicy::FailFast => {
                error!(error = %err, "shift coefficients unreadable");
                if path.exists() {
                    self.discard(&path)?;
                }
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn remove_artifact(path: &Path) -> PipelineResult<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn quarantine_destination(layout: &ExperimentLayout, artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    layout.quarantine_dir().join(format!("{}.{}", name, stamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Copies its single input to `<chunk>.<id>` under `computed/`.
    struct CopyStage {
        id: &'static str,
        from: Option<&'static str>,
        /// Treats an input containing this byte as undecodable.
        reject: Option<u8>,
        runs: Arc<AtomicUsize>,
    }

    impl CopyStage {
        fn path(layout: &ExperimentLayout, chunk: &RawChunk, id: &str) -> PathBuf {
            layout.computed_dir().join(format!("{}.{}", chunk.name, id))
        }
    }

    impl StageInstance for CopyStage {
        fn id(&self) -> &str {
            self.id
        }

        fn output_path(&self, chunk: &RawChunk, ctx: &StageContext) -> PathBuf {
            Self::path(ctx.layout, chunk, self.id)
        }

        fn inputs(&self, chunk: &RawChunk, ctx: &StageContext) -> Vec<PathBuf> {
            match self.from {
                Some(from) => vec![Self::path(ctx.layout, chunk, from)],
                None => vec![chunk.path.clone()],
            }
        }

        fn size_rule(&self, chunk: &RawChunk, _ctx: &StageContext) -> PipelineResult<Option<SizeRule>> {
            Ok(Some(SizeRule::Exact(fs::metadata(&chunk.path)?.len())))
        }

        fn process(&self, chunk: &RawChunk, ctx: &StageContext) -> PipelineResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let input = self.inputs(chunk, ctx).remove(0);
            let bytes = fs::read(&input)?;
            if let Some(bad) = self.reject {
                if bytes.contains(&bad) {
                    return Err(PipelineError::UnreadableArtifact {
                        path: input,
                        reason: "unexpected byte".into(),
                    });
                }
            }
            crate::store::atomic_write_bytes(&self.output_path(chunk, ctx), &bytes)
        }
    }

    fn orchestrator(policy: ReprocessPolicy) -> (tempfile::TempDir, Orchestrator, Arc<AtomicUsize>) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ExperimentLayout::new(dir.path());
        layout.create_dirs(false).unwrap();
        let mut config = test_config(1, 100.0);
        config.pipeline.reprocess_policy = policy;
        config.pipeline.num_workers = Some(2);
        let geometry = ElectrodeGeometry::new(vec![(0.0, 0.0)]);

        let runs = Arc::new(AtomicUsize::new(0));
        let mut orchestrator = Orchestrator::new(layout, config, geometry).unwrap();
        orchestrator.add_stage(Box::new(CopyStage {
            id: "a",
            from: None,
            reject: None,
            runs: runs.clone(),
        }));
        orchestrator.add_stage(Box::new(CopyStage {
            id: "b",
            from: Some("a"),
            reject: Some(9),
            runs: runs.clone(),
        }));
        (dir, orchestrator, runs)
    }

    fn ran(stage: &str, chunk: &str) -> CycleOutcome {
        CycleOutcome::Ran {
            stage: stage.into(),
            chunk: chunk.into(),
        }
    }

    #[test]
    fn newest_chunk_first_then_next_stage() {
        let (_dir, orch, runs) = orchestrator(ReprocessPolicy::Recompute);
        for name in ["raw_0001.bin", "raw_0002.bin"] {
            fs::write(orch.layout().raw_path(name), [1u8, 0, 2, 0]).unwrap();
        }

        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0002.bin"));
        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0001.bin"));
        assert_eq!(orch.run_cycle().unwrap(), ran("b", "raw_0002.bin"));
        assert_eq!(orch.run_cycle().unwrap(), ran("b", "raw_0001.bin"));
        assert_eq!(orch.run_cycle().unwrap(), CycleOutcome::Idle);
        assert_eq!(orch.run_cycle().unwrap(), CycleOutcome::Idle);
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn partial_frame_raw_is_skipped() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::Recompute);
        fs::write(orch.layout().raw_path("raw_0001.bin"), [1u8, 0, 2]).unwrap();
        assert_eq!(orch.run_cycle().unwrap(), CycleOutcome::Idle);
    }

    #[test]
    fn stale_artifact_is_recomputed_with_downstream() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::Recompute);
        let layout = orch.layout().clone();
        fs::write(layout.raw_path("raw_0001.bin"), [1u8, 0, 2, 0]).unwrap();
        while orch.run_cycle().unwrap() != CycleOutcome::Idle {}

        let a = layout.computed_dir().join("raw_0001.bin.a");
        let b = layout.computed_dir().join("raw_0001.bin.b");
        fs::write(&a, [9u8; 3]).unwrap();

        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0001.bin"));
        assert_eq!(fs::read(&a).unwrap(), vec![1, 0, 2, 0]);
        assert!(!b.exists());
        assert_eq!(orch.run_cycle().unwrap(), ran("b", "raw_0001.bin"));
    }

    #[test]
    fn quarantine_keeps_stale_copy() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::Quarantine);
        let layout = orch.layout().clone();
        fs::write(layout.raw_path("raw_0001.bin"), [1u8, 0, 2, 0]).unwrap();
        orch.run_cycle().unwrap();
        fs::write(layout.computed_dir().join("raw_0001.bin.a"), [7u8; 6]).unwrap();

        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0001.bin"));
        let quarantined: Vec<_> = fs::read_dir(layout.quarantine_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(quarantined.len(), 1);
        assert!(quarantined[0].starts_with("raw_0001.bin.a."));
    }

    #[test]
    fn fail_fast_stops() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::FailFast);
        let layout = orch.layout().clone();
        fs::write(layout.raw_path("raw_0001.bin"), [1u8, 0, 2, 0]).unwrap();
        orch.run_cycle().unwrap();
        fs::write(layout.computed_dir().join("raw_0001.bin.a"), [7u8; 6]).unwrap();

        let err = orch.run_cycle().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ArtifactSizeMismatch {
                expected: 4,
                found: 6,
                ..
            }
        ));
    }

    #[test]
    fn unreadable_input_is_discarded_and_other_chunks_continue() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::Recompute);
        let layout = orch.layout().clone();
        fs::write(layout.raw_path("raw_0001.bin"), [1u8, 0, 2, 0]).unwrap();
        while orch.run_cycle().unwrap() != CycleOutcome::Idle {}

        // Same size as a good artifact, so only decoding notices.
        let a = layout.computed_dir().join("raw_0001.bin.a");
        let b = layout.computed_dir().join("raw_0001.bin.b");
        fs::write(&a, [9u8; 4]).unwrap();
        fs::remove_file(&b).unwrap();
        // Older than raw_0001, so it is scanned after the damaged chunk.
        fs::write(layout.raw_path("raw_0000.bin"), [3u8, 0, 4, 0]).unwrap();

        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0000.bin"));
        // b fails on raw_0001, discards its input and moves on within the cycle.
        assert_eq!(orch.run_cycle().unwrap(), ran("b", "raw_0000.bin"));
        assert!(!a.exists());
        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0001.bin"));
        assert_eq!(orch.run_cycle().unwrap(), ran("b", "raw_0001.bin"));
        assert_eq!(orch.run_cycle().unwrap(), CycleOutcome::Idle);
        assert_eq!(fs::read(&b).unwrap(), vec![1, 0, 2, 0]);
    }

    #[test]
    fn unreadable_input_is_quarantined() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::Quarantine);
        let layout = orch.layout().clone();
        fs::write(layout.raw_path("raw_0001.bin"), [1u8, 0, 2, 0]).unwrap();
        orch.run_cycle().unwrap();
        fs::write(layout.computed_dir().join("raw_0001.bin.a"), [9u8; 4]).unwrap();

        assert_eq!(orch.run_cycle().unwrap(), CycleOutcome::Idle);
        let quarantined = fs::read_dir(layout.quarantine_dir()).unwrap().count();
        assert_eq!(quarantined, 1);
        assert_eq!(orch.run_cycle().unwrap(), ran("a", "raw_0001.bin"));
    }

    #[test]
    fn unreadable_input_stops_fail_fast() {
        let (_dir, orch, _) = orchestrator(ReprocessPolicy::FailFast);
        let layout = orch.layout().clone();
        fs::write(layout.raw_path("raw_0001.bin"), [1u8, 0, 2, 0]).unwrap();
        orch.run_cycle().unwrap();
        fs::write(layout.computed_dir().join("raw_0001.bin.a"), [9u8; 4]).unwrap();

        assert!(matches!(
            orch.run_cycle(),
            Err(PipelineError::UnreadableArtifact { .. })
        ));
        assert!(layout.computed_dir().join("raw_0001.bin.a").exists());
    }
}
