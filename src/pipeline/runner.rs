use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::{CycleOutcome, Orchestrator};
use crate::acquisition::Rechunker;
use crate::config::{load_config, ElectrodeGeometry};
use crate::error::PipelineResult;
use crate::store::layout::list_bin_files;
use crate::store::{sweep_partials, ExperimentLayout};

/// Drives the orchestrator. Apart from the idle-message flag, every decision is
/// recomputed from the experiment directory.
pub struct Driver {
    orchestrator: Orchestrator,
    rechunker: Option<Rechunker>,
    idle_sleep: Duration,
    idle_reported: bool,
}

impl Driver {
    /// Loads configuration and geometry, creates the directory tree and clears
    /// leftovers of interrupted writes.
    pub fn open(dir: &Path) -> PipelineResult<Self> {
        let layout = ExperimentLayout::new(dir);
        let config = load_config(layout.config_path())?;
        let geometry = ElectrodeGeometry::load(layout.electrodes_path(), config.n_channels)?;

        layout.create_dirs(config.use_acquisition_folder)?;
        let removed = sweep_partials(layout.root())?;
        if removed > 0 {
            warn!(removed, "removed leftovers of interrupted writes");
        }

        let rechunker = config
            .use_acquisition_folder
            .then(|| Rechunker::new(layout.clone(), &config));
        let idle_sleep = Duration::from_secs_f64(config.pipeline.idle_sleep_sec);
        let orchestrator = Orchestrator::with_default_stages(layout, config, geometry)?;
        info!(stages = ?orchestrator.stage_ids(), "pipeline ready");

        Ok(Self {
            orchestrator,
            rechunker,
            idle_sleep,
            idle_reported: false,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn watched_dir(&self) -> std::path::PathBuf {
        let layout = self.orchestrator.layout();
        if self.rechunker.is_some() {
            layout.acquisition_dir()
        } else {
            layout.raw_dir()
        }
    }

    pub fn has_input(&self) -> PipelineResult<bool> {
        Ok(!list_bin_files(&self.watched_dir(), Duration::ZERO)?.is_empty())
    }

    /// One rechunking pass followed by one orchestrator cycle.
    pub fn tick(&mut self) -> PipelineResult<CycleOutcome> {
        if let Some(rechunker) = &self.rechunker {
            rechunker.run_once()?;
        }
        let outcome = self.orchestrator.run_cycle()?;
        match &outcome {
            CycleOutcome::Idle => {
                if !self.idle_reported {
                    info!("All chunks are up to date.");
                    self.idle_reported = true;
                }
            }
            CycleOutcome::Ran { .. } => self.idle_reported = false,
        }
        Ok(outcome)
    }

    /// Ticks until a cycle finds nothing to do. Returns the number of invocations.
    pub fn run_until_idle(&mut self) -> PipelineResult<usize> {
        let mut ran = 0;
        while self.tick()? != CycleOutcome::Idle {
            ran += 1;
        }
        Ok(ran)
    }

    /// Runs forever, sleeping between idle cycles.
    pub fn run(&mut self) -> PipelineResult<()> {
        while !self.has_input()? {
            info!(dir = %self.watched_dir().display(), "waiting for .bin files");
            thread::sleep(self.idle_sleep);
        }
        loop {
            if self.tick()? == CycleOutcome::Idle {
                thread::sleep(self.idle_sleep);
            }
        }
    }
}

/// Entry point of the `start` subcommand.
pub fn run_start(dir: &Path) -> PipelineResult<()> {
    info!(dir = %dir.display(), "starting pipeline");
    Driver::open(dir)?.run()
}
