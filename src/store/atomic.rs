//! Crash-safe artifact writes: everything goes to `<final>.partial` first and is
//! renamed into place once complete.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::PipelineResult;

pub const PARTIAL_SUFFIX: &str = ".partial";

pub fn partial_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> PipelineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = partial_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> PipelineResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Builds a directory through `fill` in `<final>.partial/` and renames it into place.
pub fn atomic_write_dir<F>(path: &Path, fill: F) -> PipelineResult<()>
where
    F: FnOnce(&Path) -> PipelineResult<()>,
{
    let tmp = partial_path(path);
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;
    if let Err(err) = fill(&tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(err);
    }
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    Ok(())
}

fn sync_parent_dir(path: &Path) -> PipelineResult<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            let dir = fs::File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}

/// Removes leftover `.partial` files and directories under `root`, recursively.
/// Returns how many entries were removed.
pub fn sweep_partials(root: &Path) -> PipelineResult<usize> {
    if !root.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(PARTIAL_SUFFIX));
        let file_type = entry.file_type()?;

        if is_partial {
            warn!(path = %path.display(), "removing interrupted write");
            if file_type.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            removed += 1;
        } else if file_type.is_dir() {
            removed += sweep_partials(&path)?;
        }
    }
    if removed > 0 {
        debug!(root = %root.display(), removed, "partial sweep finished");
    }
    Ok(removed)
}
