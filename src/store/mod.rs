pub mod atomic;
pub mod layout;

use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use crate::error::{PipelineError, PipelineResult};

pub use atomic::{atomic_write_bytes, atomic_write_json, sweep_partials};
pub use layout::{DataKind, ExperimentLayout, RawChunk};

/// Frame-major matrix of `i16` samples (`frames × channels`).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMatrix {
    pub frames: usize,
    pub channels: usize,
    pub samples: Vec<i16>,
}

impl ChunkMatrix {
    pub fn new(frames: usize, channels: usize, samples: Vec<i16>) -> Self {
        debug_assert_eq!(samples.len(), frames * channels);
        Self {
            frames,
            channels,
            samples,
        }
    }

    pub fn zeros(frames: usize, channels: usize) -> Self {
        Self::new(frames, channels, vec![0; frames * channels])
    }

    pub fn from_le_bytes(bytes: &[u8], channels: usize) -> Option<Self> {
        let frame_bytes = 2 * channels;
        if channels == 0 || bytes.len() % frame_bytes != 0 {
            return None;
        }
        let samples = decode_i16(bytes);
        Some(Self::new(samples.len() / channels, channels, samples))
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        encode_i16(&self.samples)
    }

    #[inline]
    pub fn get(&self, frame: usize, channel: usize) -> i16 {
        self.samples[frame * self.channels + channel]
    }

    pub fn frame(&self, frame: usize) -> &[i16] {
        let start = frame * self.channels;
        &self.samples[start..start + self.channels]
    }

    /// Copies one channel out as `f64`.
    pub fn channel(&self, channel: usize) -> Vec<f64> {
        (0..self.frames)
            .map(|f| self.get(f, channel) as f64)
            .collect()
    }

    /// Builds a matrix from channel-major traces of equal length.
    pub fn from_channels(traces: &[Vec<i16>]) -> Self {
        let channels = traces.len();
        let frames = traces.first().map_or(0, Vec::len);
        let mut samples = vec![0i16; frames * channels];
        for (ch, trace) in traces.iter().enumerate() {
            for (f, &v) in trace.iter().enumerate() {
                samples[f * channels + ch] = v;
            }
        }
        Self::new(frames, channels, samples)
    }

    /// The first `frames` frames (or fewer if the matrix is shorter).
    pub fn head(&self, frames: usize) -> Self {
        let frames = frames.min(self.frames);
        Self::new(
            frames,
            self.channels,
            self.samples[..frames * self.channels].to_vec(),
        )
    }

    pub fn duration_sec(&self, sampling_frequency: f64) -> f64 {
        self.frames as f64 / sampling_frequency
    }
}

/// Trailing bytes that do not form a whole sample are ignored.
pub fn decode_i16(bytes: &[u8]) -> Vec<i16> {
    let mut out = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes[..out.len() * 2], &mut out);
    out
}

pub fn encode_i16(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

pub fn encode_f32(values: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut out);
    out
}

pub fn decode_f32(bytes: &[u8]) -> Vec<f32> {
    let mut out = vec![0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(&bytes[..out.len() * 4], &mut out);
    out
}

/// Number of whole frames in a file of `len` bytes, or `CorruptArtifact`.
pub fn frames_in(path: &Path, len: u64, n_channels: usize) -> PipelineResult<u64> {
    let frame_bytes = 2 * n_channels as u64;
    if frame_bytes == 0 || len % frame_bytes != 0 {
        return Err(PipelineError::CorruptArtifact {
            path: path.to_path_buf(),
            len,
            frame_bytes,
        });
    }
    Ok(len / frame_bytes)
}

pub fn read_chunk(path: &Path, n_channels: usize) -> PipelineResult<ChunkMatrix> {
    let bytes = fs::read(path)?;
    frames_in(path, bytes.len() as u64, n_channels)?;
    ChunkMatrix::from_le_bytes(&bytes, n_channels)
        .ok_or_else(|| PipelineError::MissingArtifact(path.to_path_buf()))
}

pub fn write_chunk(path: &Path, matrix: &ChunkMatrix) -> PipelineResult<()> {
    atomic_write_bytes(path, &matrix.to_le_bytes())
}

/// Reads frames `[start, end)` by seeking, without loading the rest of the file.
pub fn read_frame_range(
    path: &Path,
    n_channels: usize,
    start_frame: u64,
    end_frame: u64,
) -> PipelineResult<ChunkMatrix> {
    let mut file = File::open(path)?;
    let total = frames_in(path, file.metadata()?.len(), n_channels)?;
    let end_frame = end_frame.min(total);
    let start_frame = start_frame.min(end_frame);
    let frame_bytes = 2 * n_channels as u64;

    file.seek(SeekFrom::Start(start_frame * frame_bytes))?;
    let frames = (end_frame - start_frame) as usize;
    let mut samples = vec![0i16; frames * n_channels];
    file.read_i16_into::<LittleEndian>(&mut samples)?;
    Ok(ChunkMatrix::new(frames, n_channels, samples))
}
