//! Application entry point for the blob hierarchy viewer.
//!
//! Sets up logging and eframe, then hands everything else to [`Viewer`].
//! An optional first argument names a JSON configuration file; missing
//! fields take their defaults.

mod viewer;

use blob_core::config::Config;
use tracing::{error, info};
use viewer::Viewer;

/// Reads the configuration named on the command line, if any.
fn load_config() -> Config {
    let Some(path) = std::env::args().nth(1) else {
        return Config::default();
    };
    let parsed = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| Config::from_json_str(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(cfg) => {
            info!(%path, "loaded configuration");
            cfg
        }
        Err(e) => {
            error!(%path, error = %e, "falling back to the default configuration");
            Config::default()
        }
    }
}

fn main() -> eframe::Result<()> {
    tracing_subscriber::fmt::init();

    let viewer = Viewer::new(load_config())
        .or_else(|e| {
            error!(error = %e, "configuration rejected, using defaults");
            Viewer::new(Config::default())
        })
        .map_err(|e| eframe::Error::AppCreation(Box::new(e)))?;

    eframe::run_native(
        "Blob Hierarchy",
        eframe::NativeOptions::default(),
        Box::new(|_cc| Ok(Box::new(viewer))),
    )
}
