use anyhow::Result;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Enable file logging when `SUGYA_LOG` is set (e.g. `SUGYA_LOG=sugya=debug`).
/// The log lands next to the config file; the terminal belongs to ratatui and
/// never receives log output.
pub fn init() -> Result<()> {
    let filter = match std::env::var("SUGYA_LOG") {
        Ok(value) if !value.is_empty() => value,
        _ => return Ok(()),
    };

    let path = Config::log_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}
