use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use realtime_mea::pipeline::runner::Driver;
use realtime_mea::processing::shifts::ShiftCoefficients;
use realtime_mea::processing::sorting::{peak_channel, SpikeSidecar};
use realtime_mea::store::{decode_f32, encode_i16, read_chunk, ExperimentLayout};
use realtime_mea::CycleOutcome;

const FS: usize = 2000;
const CHANNELS: usize = 4;

fn config_yaml(use_acquisition_folder: bool) -> String {
    format!(
        "sampling_frequency: {FS}
n_channels: {CHANNELS}
filter_params:
  lowcut: 50
  highcut: 500
  order: 2
detect_threshold_for_spike_stats: -20
high_activity_threshold: 3
raw_chunk_duration_sec: 1.0
use_acquisition_folder: {use_acquisition_folder}
pipeline:
  quiet_period_sec: 0
  idle_sleep_sec: 0
  num_workers: 2
coarse_sorting:
  detect_threshold: -30
  strategy:
    kind: kmeans
    num_clusters: 3
    n_init: 2
    max_iterations: 30
    seed: 5
"
    )
}

fn experiment(use_acquisition_folder: bool) -> (tempfile::TempDir, ExperimentLayout) {
    let dir = tempfile::tempdir().unwrap();
    let layout = ExperimentLayout::new(dir.path());
    fs::write(layout.config_path(), config_yaml(use_acquisition_folder)).unwrap();
    fs::write(layout.electrodes_path(), "0 0\n100 0\n200 0\n300 0\n").unwrap();
    (dir, layout)
}

/// Noise with a few large negative deflections, frame-major bytes.
fn recording(frames: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = vec![0i16; frames * CHANNELS];
    for s in samples.iter_mut() {
        *s = rng.gen_range(-4..=4);
    }
    let mut t = 40;
    while t + 4 < frames {
        let ch = rng.gen_range(0..CHANNELS);
        samples[t * CHANNELS + ch] -= 300;
        samples[(t + 1) * CHANNELS + ch] -= 150;
        t += rng.gen_range(60..140);
    }
    encode_i16(&samples)
}

fn write_raw(layout: &ExperimentLayout, name: &str, seed: u64) {
    fs::create_dir_all(layout.raw_dir()).unwrap();
    fs::write(layout.raw_path(name), recording(FS, seed)).unwrap();
}

fn artifacts(layout: &ExperimentLayout, chunk: &str) -> Vec<std::path::PathBuf> {
    vec![
        layout.filt_path(chunk),
        layout.shifted_path(chunk),
        layout.high_activity_path(chunk),
        layout.stats_path(chunk),
        layout.templates_path(chunk),
        layout.preview_path(chunk),
    ]
}

fn assert_ordered(layout: &ExperimentLayout, chunk: &str) {
    let paths = artifacts(layout, chunk);
    for pair in paths.windows(2) {
        if pair[1].exists() {
            assert!(pair[0].exists(), "{} exists without {}", pair[1].display(), pair[0].display());
        }
    }
}

fn no_partials(root: &Path) -> bool {
    fs::read_dir(root).unwrap().all(|entry| {
        let entry = entry.unwrap();
        let name = entry.file_name().into_string().unwrap();
        !name.ends_with(".partial") && (!entry.path().is_dir() || no_partials(&entry.path()))
    })
}

#[test]
fn processes_every_chunk_once_and_in_order() {
    let (dir, layout) = experiment(false);
    write_raw(&layout, "raw_0001.bin", 1);
    write_raw(&layout, "raw_0002.bin", 2);

    let mut driver = Driver::open(dir.path()).unwrap();
    let mut invocations = 0;
    loop {
        let outcome = driver.tick().unwrap();
        for chunk in ["raw_0001.bin", "raw_0002.bin"] {
            assert_ordered(&layout, chunk);
        }
        match outcome {
            CycleOutcome::Idle => break,
            CycleOutcome::Ran { .. } => invocations += 1,
        }
    }
    // Six per-chunk stages for two chunks, plus one shift estimate.
    assert_eq!(invocations, 13);

    for chunk in ["raw_0001.bin", "raw_0002.bin"] {
        for path in artifacts(&layout, chunk) {
            assert!(path.exists(), "missing {}", path.display());
        }
        let raw_len = fs::metadata(layout.raw_path(chunk)).unwrap().len();
        assert_eq!(fs::metadata(layout.filt_path(chunk)).unwrap().len(), raw_len);
        assert_eq!(fs::metadata(layout.shifted_path(chunk)).unwrap().len(), raw_len);
        assert!(layout.spikes_path(chunk).exists());
        assert!(layout.preview_path(chunk).join("index.json").exists());
    }

    let coefficients = ShiftCoefficients::load(&layout.shift_coeffs_path()).unwrap().unwrap();
    // Estimated from the newest chunk.
    assert_eq!(coefficients.source_chunk, "raw_0002.bin");

    // Idempotence: nothing left to do and nothing rewritten.
    let before = fs::metadata(layout.filt_path("raw_0001.bin")).unwrap().modified().unwrap();
    assert_eq!(driver.run_until_idle().unwrap(), 0);
    let after = fs::metadata(layout.filt_path("raw_0001.bin")).unwrap().modified().unwrap();
    assert_eq!(before, after);
    assert!(no_partials(dir.path()));
}

#[test]
fn templates_are_sorted_by_peak_x() {
    let (dir, layout) = experiment(false);
    write_raw(&layout, "raw_0001.bin", 11);
    Driver::open(dir.path()).unwrap().run_until_idle().unwrap();

    let templates = decode_f32(&fs::read(layout.templates_path("raw_0001.bin")).unwrap());
    assert_eq!(templates.len() % CHANNELS, 0);
    let xs: Vec<usize> = templates
        .chunks(CHANNELS)
        .map(|t| 100 * peak_channel(t))
        .collect();
    assert!(xs.windows(2).all(|w| w[0] <= w[1]), "{:?}", xs);

    let sidecar: SpikeSidecar =
        serde_json::from_slice(&fs::read(layout.spikes_path("raw_0001.bin")).unwrap()).unwrap();
    assert_eq!(sidecar.num_templates, templates.len() / CHANNELS);
    assert_eq!(sidecar.labels.len(), sidecar.spike_times_sec.len());
    assert!(sidecar.labels.iter().all(|&l| l <= sidecar.num_templates));
}

#[test]
fn recovers_from_interrupted_and_truncated_writes() {
    let (dir, layout) = experiment(false);
    write_raw(&layout, "raw_0001.bin", 3);
    Driver::open(dir.path()).unwrap().run_until_idle().unwrap();

    // A crash mid-write leaves a partial file; a foreign tool truncated filt.
    let stray = layout.computed_dir().join("filt").join("raw_0001.bin.filt.partial");
    fs::write(&stray, b"half").unwrap();
    let filt = layout.filt_path("raw_0001.bin");
    let good = fs::read(&filt).unwrap();
    fs::write(&filt, &good[..good.len() - 8]).unwrap();

    let mut driver = Driver::open(dir.path()).unwrap();
    assert!(!stray.exists());
    assert!(driver.run_until_idle().unwrap() >= 6);

    assert_eq!(fs::read(&filt).unwrap(), good);
    for path in artifacts(&layout, "raw_0001.bin") {
        assert!(path.exists(), "missing {}", path.display());
    }
}

#[test]
fn damaged_json_artifact_does_not_stall_other_chunks() {
    let (dir, layout) = experiment(false);
    write_raw(&layout, "raw_0001.bin", 4);
    write_raw(&layout, "raw_0002.bin", 5);
    let mut driver = Driver::open(dir.path()).unwrap();
    driver.run_until_idle().unwrap();

    fs::remove_file(layout.templates_path("raw_0001.bin")).unwrap();
    fs::write(layout.high_activity_path("raw_0001.bin"), "{not json").unwrap();
    write_raw(&layout, "raw_0003.bin", 6);

    for _ in 0..3 {
        driver.tick().unwrap();
    }
    // A cycle that only discards the damaged file reports idle; the repair
    // happens on the following pass.
    driver.run_until_idle().unwrap();
    driver.run_until_idle().unwrap();

    for chunk in ["raw_0001.bin", "raw_0002.bin", "raw_0003.bin"] {
        for path in artifacts(&layout, chunk) {
            assert!(path.exists(), "missing {}", path.display());
        }
    }
    let repaired: serde_json::Value =
        serde_json::from_slice(&fs::read(layout.high_activity_path("raw_0001.bin")).unwrap()).unwrap();
    assert!(repaired["high_activity_intervals"].is_array());
    assert_eq!(driver.run_until_idle().unwrap(), 0);
}

#[test]
fn rechunker_feeds_the_pipeline() {
    let (dir, layout) = experiment(true);
    fs::create_dir_all(layout.acquisition_dir()).unwrap();
    // 2.5 chunks worth of frames split over two capture files.
    let data = recording(FS * 5 / 2, 9);
    let split = 1500 * CHANNELS * 2;
    fs::write(layout.acquisition_dir().join("capture_001.bin"), &data[..split]).unwrap();
    fs::write(layout.acquisition_dir().join("capture_002.bin"), &data[split..]).unwrap();

    let mut driver = Driver::open(dir.path()).unwrap();
    assert!(driver.has_input().unwrap());
    driver.run_until_idle().unwrap();

    let first = read_chunk(&layout.raw_path("raw_0001.bin"), CHANNELS).unwrap();
    let second = read_chunk(&layout.raw_path("raw_0002.bin"), CHANNELS).unwrap();
    assert_eq!(first.frames, FS);
    assert_eq!(second.frames, FS);
    assert!(!layout.raw_path("raw_0003.bin").exists());
    assert_eq!(first.to_le_bytes(), data[..FS * CHANNELS * 2].to_vec());
    assert!(layout.templates_path("raw_0002.bin").exists());
}

#[test]
fn geometry_mismatch_is_fatal() {
    let (dir, layout) = experiment(false);
    fs::write(layout.electrodes_path(), "0 0\n100 0\n").unwrap();
    assert!(matches!(
        Driver::open(dir.path()),
        Err(realtime_mea::PipelineError::Geometry {
            expected: 4,
            found: 2
        })
    ));
}
