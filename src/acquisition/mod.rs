//! Re-slices irregular capture files from `acquisition/` into fixed-length raw chunks.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::PipelineResult;
use crate::store::layout::{is_settled, list_bin_files};
use crate::store::{atomic_write_bytes, ExperimentLayout};

struct CaptureFile {
    path: PathBuf,
    frames: u64,
}

pub struct Rechunker {
    layout: ExperimentLayout,
    n_channels: usize,
    frames_per_chunk: u64,
    quiet_period: Duration,
}

impl Rechunker {
    pub fn new(layout: ExperimentLayout, config: &Config) -> Self {
        Self {
            layout,
            n_channels: config.n_channels,
            frames_per_chunk: config.frames_per_chunk() as u64,
            quiet_period: Duration::from_secs_f64(config.pipeline.quiet_period_sec),
        }
    }

    fn frame_bytes(&self) -> u64 {
        2 * self.n_channels as u64
    }

    /// Capture files with a whole number of frames, in name order, up to the
    /// first one still being written. Stream offsets stay those of a prefix of
    /// the capture sequence.
    fn capture_files(&self) -> PipelineResult<Vec<CaptureFile>> {
        let mut files = Vec::new();
        for path in list_bin_files(&self.layout.acquisition_dir(), Duration::ZERO)? {
            let metadata = fs::metadata(&path)?;
            if !is_settled(&metadata, self.quiet_period) {
                debug!(path = %path.display(), "capture file still being written");
                break;
            }
            let len = metadata.len();
            if len % self.frame_bytes() != 0 {
                warn!(
                    path = %path.display(),
                    len,
                    "skipping capture file whose size is not a whole number of frames"
                );
                continue;
            }
            files.push(CaptureFile {
                frames: len / self.frame_bytes(),
                path,
            });
        }
        Ok(files)
    }

    /// Frames already emitted (sum over `raw/raw_*.bin`) and the next chunk index.
    fn emitted(&self) -> PipelineResult<(u64, u64)> {
        let chunks = self.layout.list_raw_chunks(Duration::ZERO)?;
        let mut frames = 0;
        let mut last_index = 0;
        for chunk in chunks.iter().filter(|c| c.name.starts_with("raw_")) {
            frames += fs::metadata(&chunk.path)?.len() / self.frame_bytes();
            last_index = last_index.max(chunk.index);
        }
        Ok((frames, last_index + 1))
    }

    /// Emits every complete chunk currently available. Returns the number written.
    pub fn run_once(&self) -> PipelineResult<usize> {
        let files = self.capture_files()?;
        let total: u64 = files.iter().map(|f| f.frames).sum();
        let (mut emitted, mut next_index) = self.emitted()?;

        let mut written = 0;
        while total.saturating_sub(emitted) >= self.frames_per_chunk {
            let bytes = self.read_frames(&files, emitted, self.frames_per_chunk)?;
            let name = format!("raw_{:04}.bin", next_index);
            atomic_write_bytes(&self.layout.raw_path(&name), &bytes)?;
            info!(chunk = %name, frames = self.frames_per_chunk, "emitted raw chunk");

            emitted += self.frames_per_chunk;
            next_index += 1;
            written += 1;
        }
        Ok(written)
    }

    /// Reads `count` frames starting at global frame `offset`, across file boundaries.
    fn read_frames(&self, files: &[CaptureFile], offset: u64, count: u64) -> PipelineResult<Vec<u8>> {
        let frame_bytes = self.frame_bytes();
        let mut out = Vec::with_capacity((count * frame_bytes) as usize);
        let mut file_start = 0u64;
        let mut remaining = count;
        let mut cursor = offset;

        for capture in files {
            let file_end = file_start + capture.frames;
            if remaining == 0 {
                break;
            }
            if cursor < file_end {
                let local = cursor - file_start;
                let take = remaining.min(capture.frames - local);
                let mut file = File::open(&capture.path)?;
                file.seek(SeekFrom::Start(local * frame_bytes))?;
                let mut buf = vec![0u8; (take * frame_bytes) as usize];
                file.read_exact(&mut buf)?;
                out.extend_from_slice(&buf);
                cursor += take;
                remaining -= take;
            }
            file_start = file_end;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::{encode_i16, read_chunk};

    fn setup(chunk_frames: f64) -> (tempfile::TempDir, ExperimentLayout, Config) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ExperimentLayout::new(dir.path());
        layout.create_dirs(true).unwrap();
        let mut config = test_config(2, 100.0);
        config.raw_chunk_duration_sec = chunk_frames / 100.0;
        (dir, layout, config)
    }

    fn capture(layout: &ExperimentLayout, name: &str, first: i16, frames: usize) {
        let samples: Vec<i16> = (0..frames * 2).map(|i| first + i as i16).collect();
        fs::write(layout.acquisition_dir().join(name), encode_i16(&samples)).unwrap();
    }

    #[test]
    fn emits_only_complete_chunks_across_files() {
        let (_dir, layout, config) = setup(30.0);
        capture(&layout, "cap_a.bin", 0, 25);
        capture(&layout, "cap_b.bin", 50, 40);
        capture(&layout, "cap_c.bin", 130, 3);

        let rechunker = Rechunker::new(layout.clone(), &config);
        assert_eq!(rechunker.run_once().unwrap(), 2);

        let first = read_chunk(&layout.raw_path("raw_0001.bin"), 2).unwrap();
        assert_eq!(first.frames, 30);
        let expected: Vec<i16> = (0..60).collect();
        assert_eq!(first.samples, expected);

        let second = read_chunk(&layout.raw_path("raw_0002.bin"), 2).unwrap();
        assert_eq!(second.frames, 30);
        assert_eq!(second.samples[0], 60);

        // 68 frames in total, 60 emitted: nothing more until data arrives.
        assert_eq!(rechunker.run_once().unwrap(), 0);
        assert!(!layout.raw_path("raw_0003.bin").exists());
    }

    #[test]
    fn misaligned_capture_is_skipped() {
        let (_dir, layout, config) = setup(10.0);
        capture(&layout, "cap_a.bin", 0, 10);
        fs::write(layout.acquisition_dir().join("cap_b.bin"), [0u8; 7]).unwrap();
        capture(&layout, "cap_c.bin", 100, 10);

        let rechunker = Rechunker::new(layout.clone(), &config);
        assert_eq!(rechunker.run_once().unwrap(), 2);
        let second = read_chunk(&layout.raw_path("raw_0002.bin"), 2).unwrap();
        assert_eq!(second.samples[0], 100);
    }

    #[test]
    fn index_continues_after_existing_chunks() {
        let (_dir, layout, config) = setup(10.0);
        fs::write(layout.raw_path("raw_0004.bin"), vec![0u8; 40]).unwrap();
        capture(&layout, "cap_a.bin", 0, 25);

        let rechunker = Rechunker::new(layout.clone(), &config);
        assert_eq!(rechunker.run_once().unwrap(), 1);
        let chunk = read_chunk(&layout.raw_path("raw_0005.bin"), 2).unwrap();
        // The existing chunk accounts for the first 10 frames.
        assert_eq!(chunk.samples[0], 20);
    }

    #[test]
    fn files_after_a_hot_capture_wait() {
        let (_dir, layout, mut config) = setup(10.0);
        config.pipeline.quiet_period_sec = 3600.0;
        capture(&layout, "cap_a.bin", 0, 10);
        capture(&layout, "cap_b.bin", 100, 10);
        capture(&layout, "cap_c.bin", 200, 10);
        let age = |name: &str| {
            let file = fs::File::options()
                .write(true)
                .open(layout.acquisition_dir().join(name))
                .unwrap();
            file.set_modified(std::time::SystemTime::now() - Duration::from_secs(7200))
                .unwrap();
        };
        age("cap_a.bin");
        age("cap_c.bin");

        let rechunker = Rechunker::new(layout.clone(), &config);
        assert_eq!(rechunker.run_once().unwrap(), 1);
        assert!(!layout.raw_path("raw_0002.bin").exists());

        age("cap_b.bin");
        assert_eq!(rechunker.run_once().unwrap(), 2);
        let second = read_chunk(&layout.raw_path("raw_0002.bin"), 2).unwrap();
        assert_eq!(second.samples[0], 100);
        let third = read_chunk(&layout.raw_path("raw_0003.bin"), 2).unwrap();
        assert_eq!(third.samples[0], 200);
    }
}
