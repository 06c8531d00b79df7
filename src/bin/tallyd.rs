//! tallyd - Trash Tally dashboard daemon
//!
//! This daemon:
//! 1. Loads configuration (TALLY_CONFIG file + TALLY_* env overrides)
//! 2. Restores counters and threshold from the SQLite key-value store
//! 3. Loads the detector model
//! 4. Acquires the configured frame source (camera or remote stream)
//! 5. Serves the control API on loopback
//! 6. Runs the control loop until Ctrl-C

use anyhow::Result;
use clap::Parser;

#[path = "../ui.rs"]
mod ui;

use trash_tally::{
    api::{ApiConfig, ApiServer},
    config::DashboardConfig,
    detect::backend_from_settings,
    CanvasSurface, ControlLoop, Detector, SourceVariant, SqliteKeyValueStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Progress output: auto, plain, or pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_flag(&args.ui);

    let cfg = DashboardConfig::load()?;
    let store = SqliteKeyValueStore::open(&cfg.db_path)?;
    let detector = Detector::new(backend_from_settings(&cfg.detector)?);
    let mut control = ControlLoop::from_config(&cfg, Box::new(store), detector, CanvasSurface::new());

    // Failures below leave the daemon up; the user retries through the API.
    let stage = ui.stage(ui::STAGE_MODEL);
    match control.initialize_model() {
        Ok(()) => drop(stage),
        Err(err) => stage.fail(&err),
    }

    let (stage_name, variant) = match &cfg.remote_url {
        Some(url) => (ui::STAGE_REMOTE, SourceVariant::RemoteImage(url.clone())),
        None => (ui::STAGE_CAMERA, SourceVariant::Camera(cfg.camera.facing)),
    };
    let stage = ui.stage(stage_name);
    match control.activate(variant) {
        Ok(()) => drop(stage),
        Err(err) => stage.fail(&err),
    }

    let api_config = ApiConfig {
        addr: cfg.api_addr.clone(),
        token_path: cfg.api_token_path.clone(),
    };
    let api_handle = ApiServer::new(api_config, control.handle()).spawn()?;
    if let Some(path) = &api_handle.token_path {
        log::info!("control api token written to {}", path.display());
    } else {
        log::warn!("control api token (handle securely): {}", api_handle.token);
    }

    let handle = control.handle();
    ctrlc::set_handler(move || handle.shutdown()).expect("error setting Ctrl-C handler");

    log::info!(
        "tallyd running. counting [{}] at {}%, state in {}",
        cfg.trash_types.iter().collect::<Vec<_>>().join(", "),
        control.status().threshold_percent,
        cfg.db_path
    );
    control.run();

    log::info!("shutdown signal received, stopping control api...");
    api_handle.stop()?;
    Ok(())
}
