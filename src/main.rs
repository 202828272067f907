use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;

use realtime_mea::pipeline::runner::run_start;
use realtime_mea::server::{self, AppState};
use realtime_mea::store::ExperimentLayout;
use realtime_mea::utils::log::init_logging;

/// Incremental processing and serving of multi-electrode-array recordings
#[derive(Parser, Debug)]
#[command(name = "realtime-mea")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Logging verbosity (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also append logs to this file under <dir>/logs/
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the experiment directory and process new chunks
    Start {
        /// Experiment directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },

    /// Serve raw and derived data over HTTP
    Serve {
        /// Experiment directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port
        #[arg(short, long, default_value = "5000")]
        port: u16,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let dir = match &cli.command {
        Commands::Start { dir } | Commands::Serve { dir, .. } => dir.clone(),
    };
    init_logging(&cli.log_level, &dir, cli.log_file.as_deref())
        .context("failed to initialise logging")?;

    match cli.command {
        Commands::Start { dir } => {
            run_start(&dir).with_context(|| format!("pipeline stopped in {}", dir.display()))?;
        }
        Commands::Serve { dir, host, port } => {
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", host, port))?;
            let state = AppState::open(ExperimentLayout::new(&dir))
                .with_context(|| format!("cannot open experiment {}", dir.display()))?;

            print_banner(addr);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime
                .block_on(server::serve(state, addr))
                .context("range service failed")?;
        }
    }
    Ok(())
}

fn print_banner(addr: SocketAddr) {
    println!("{}", format!("realtime-mea range service on http://{}", addr).green().bold());
    for route in [
        "/api/config",
        "/api/files",
        "/api/shift_coefficients",
        "/api/{raw,filt,shifted}/<chunk>?start_sec&end_sec",
        "/api/high_activity/<chunk>",
        "/api/stats/<chunk>",
        "/api/templates/<chunk>",
        "/api/spikes/<chunk>",
        "/api/preview/<chunk>/<path>",
    ] {
        println!("  {}", route.cyan());
    }
}
