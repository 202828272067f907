use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::config::{electrodes::ELECTRODE_FILE_NAME, CONFIG_FILE_NAME};
use crate::error::PipelineResult;

pub const FILT_SUFFIX: &str = ".filt";
pub const SHIFTED_SUFFIX: &str = ".shifted";
pub const HIGH_ACTIVITY_SUFFIX: &str = ".high_activity.json";
pub const STATS_SUFFIX: &str = ".stats.json";
pub const TEMPLATES_SUFFIX: &str = ".templates";
pub const SPIKES_SUFFIX: &str = ".spikes.json";
pub const PREVIEW_SUFFIX: &str = ".figpack";
pub const SHIFT_COEFFS_FILE: &str = "shift_coeffs.yaml";

/// A raw recording chunk, identified by the trailing integer of its stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub name: String,
    pub index: u64,
    pub path: PathBuf,
}

impl RawChunk {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        let stem = path.file_stem()?.to_str()?;
        let index = trailing_index(stem)?;
        Some(Self {
            name,
            index,
            path: path.to_path_buf(),
        })
    }
}

/// Parses the run of ASCII digits at the end of `stem`.
pub fn trailing_index(stem: &str) -> Option<u64> {
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits_start..].parse().ok()
}

/// Kinds of frame-major `i16` matrices that can be range-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Raw,
    Filt,
    Shifted,
}

impl DataKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "raw" => Some(Self::Raw),
            "filt" => Some(Self::Filt),
            "shifted" => Some(Self::Shifted),
            _ => None,
        }
    }
}

/// Every path of an experiment directory.
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    pub fn electrodes_path(&self) -> PathBuf {
        self.root.join(ELECTRODE_FILE_NAME)
    }

    pub fn acquisition_dir(&self) -> PathBuf {
        self.root.join("acquisition")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn computed_dir(&self) -> PathBuf {
        self.root.join("computed")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.computed_dir().join("quarantine")
    }

    pub fn shift_coeffs_path(&self) -> PathBuf {
        self.computed_dir().join(SHIFT_COEFFS_FILE)
    }

    pub fn raw_path(&self, chunk: &str) -> PathBuf {
        self.raw_dir().join(chunk)
    }

    pub fn filt_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "filt", FILT_SUFFIX)
    }

    pub fn shifted_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "shifted", SHIFTED_SUFFIX)
    }

    pub fn high_activity_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "high_activity", HIGH_ACTIVITY_SUFFIX)
    }

    pub fn stats_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "stats", STATS_SUFFIX)
    }

    pub fn templates_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "templates", TEMPLATES_SUFFIX)
    }

    pub fn spikes_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "templates", SPIKES_SUFFIX)
    }

    pub fn preview_path(&self, chunk: &str) -> PathBuf {
        self.artifact(chunk, "preview", PREVIEW_SUFFIX)
    }

    pub fn data_path(&self, kind: DataKind, chunk: &str) -> PathBuf {
        match kind {
            DataKind::Raw => self.raw_path(chunk),
            DataKind::Filt => self.filt_path(chunk),
            DataKind::Shifted => self.shifted_path(chunk),
        }
    }

    fn artifact(&self, chunk: &str, subdir: &str, suffix: &str) -> PathBuf {
        self.computed_dir()
            .join(subdir)
            .join(format!("{}{}", chunk, suffix))
    }

    pub fn create_dirs(&self, use_acquisition_folder: bool) -> PipelineResult<()> {
        fs::create_dir_all(self.raw_dir())?;
        for sub in ["filt", "shifted", "high_activity", "stats", "templates", "preview", "quarantine"] {
            fs::create_dir_all(self.computed_dir().join(sub))?;
        }
        if use_acquisition_folder {
            fs::create_dir_all(self.acquisition_dir())?;
        }
        Ok(())
    }

    /// Raw chunks not modified within `quiet_period`, newest (highest index) first.
    pub fn list_raw_chunks(&self, quiet_period: Duration) -> PipelineResult<Vec<RawChunk>> {
        let mut chunks = Vec::new();
        for path in list_bin_files(&self.raw_dir(), quiet_period)? {
            match RawChunk::from_path(&path) {
                Some(chunk) => chunks.push(chunk),
                None => warn!(path = %path.display(), "ignoring raw file without a chunk index"),
            }
        }
        chunks.sort_by(|a, b| b.index.cmp(&a.index).then_with(|| b.name.cmp(&a.name)));
        Ok(chunks)
    }
}

/// `.bin` files of `dir`, sorted by name, skipping those modified within `quiet_period`.
pub fn list_bin_files(dir: &Path, quiet_period: Duration) -> PipelineResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let now = SystemTime::now();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        if !quiet_period.is_zero() && recently_modified(&metadata, now, quiet_period) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Whether a file has gone `quiet_period` without modification.
pub fn is_settled(metadata: &fs::Metadata, quiet_period: Duration) -> bool {
    quiet_period.is_zero() || !recently_modified(metadata, SystemTime::now(), quiet_period)
}

fn recently_modified(metadata: &fs::Metadata, now: SystemTime, quiet_period: Duration) -> bool {
    match metadata.modified() {
        Ok(modified) => match now.duration_since(modified) {
            Ok(age) => age < quiet_period,
            // mtime in the future
            Err(_) => true,
        },
        Err(_) => false,
    }
}

/// Rejects names that could escape the experiment directory.
pub fn is_safe_chunk_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.contains('\0')
}
