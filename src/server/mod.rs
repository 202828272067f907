//! Read-only HTTP range service over an experiment directory.

pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::HeaderName, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{load_config, Config, ElectrodeGeometry};
use crate::error::PipelineResult;
use crate::store::ExperimentLayout;

/// Metadata headers the browser must be allowed to read.
pub const EXPOSED_HEADERS: [&str; 7] = [
    "x-start-sec",
    "x-end-sec",
    "x-num-frames",
    "x-num-channels",
    "x-sampling-frequency",
    "x-num-templates",
    "content-range",
];

pub struct AppState {
    pub layout: ExperimentLayout,
    pub config: Config,
    pub geometry: Option<ElectrodeGeometry>,
}

impl AppState {
    /// Loads the experiment configuration. A missing or mismatched geometry file
    /// only drops the coordinates from `/api/config`.
    pub fn open(layout: ExperimentLayout) -> PipelineResult<Self> {
        let config = load_config(layout.config_path())?;
        let geometry = match ElectrodeGeometry::load(layout.electrodes_path(), config.n_channels) {
            Ok(geometry) => Some(geometry),
            Err(err) => {
                warn!(error = %err, "electrode geometry unavailable");
                None
            }
        };
        Ok(Self {
            layout,
            config,
            geometry,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .expose_headers(EXPOSED_HEADERS.map(HeaderName::from_static));

    Router::new()
        .route("/api/config", get(handlers::get_config))
        .route("/api/files", get(handlers::list_files))
        .route("/api/shift_coefficients", get(handlers::get_shift_coefficients))
        .route("/api/templates/:chunk", get(handlers::get_templates))
        .route("/api/spikes/:chunk", get(handlers::get_spikes))
        .route("/api/high_activity/:chunk", get(handlers::get_high_activity))
        .route("/api/stats/:chunk", get(handlers::get_stats))
        .route("/api/preview/:chunk/*path", get(handlers::get_preview))
        .route("/api/:kind/:chunk", get(handlers::get_range))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Binds `addr` and serves until the process is stopped.
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Range service listening on http://{}", addr);
    axum::serve(listener, app).await
}
