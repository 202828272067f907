use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_DIR: &str = "logs";

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `level`. When `log_file` is given, events are
/// also appended (without ANSI colours) to `<base_dir>/logs/<log_file>`.
/// Calling this more than once is harmless; later calls keep the first subscriber.
pub fn init_logging(level: &str, base_dir: &Path, log_file: Option<&str>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match log_file {
        Some(name) => {
            let path = log_file_path(base_dir, name)?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init();

    if let Err(err) = result {
        // Only "a global default is already set" can happen here.
        tracing::debug!("logging already initialised: {}", err);
    }
    Ok(())
}

/// Creates `<base_dir>/logs/` if needed and returns the path of `name` inside it.
pub fn log_file_path(base_dir: &Path, name: &str) -> std::io::Result<PathBuf> {
    let log_dir = base_dir.join(LOG_DIR);
    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)?;
    }
    Ok(log_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(dir.path(), "pipeline.log").unwrap();
        assert!(dir.path().join("logs").is_dir());
        assert_eq!(path, dir.path().join("logs").join("pipeline.log"));
    }

    #[test]
    fn repeated_initialisation_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        init_logging("debug", dir.path(), None).unwrap();
        init_logging("info", dir.path(), Some("second.log")).unwrap();
        assert!(dir.path().join("logs").join("second.log").exists());
    }
}
