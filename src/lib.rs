pub mod acquisition;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod processing;
pub mod server;
pub mod store;
pub mod utils;

pub use config::{load_config, Config, ElectrodeGeometry};
pub use error::{PipelineError, PipelineResult};
pub use pipeline::{CycleOutcome, Orchestrator};
