//! Local mirror of executed cell sources.
//!
//! A lightweight companion to the telemetry tracker: the source of every
//! cell is written to a timestamped file under a local directory just
//! before it runs. No network, no shared state; write failures are skipped
//! silently.

use std::io;
use std::path::PathBuf;

use chrono::Utc;
use tracing::debug;

use crate::collector::{CellEventBus, CellInfo};

pub struct CellLogger {
    log_dir: PathBuf,
}

impl CellLogger {
    /// Creates the logger, making sure the log directory exists.
    pub fn new(log_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir })
    }

    /// Writes the source of the cell about to run to a timestamped file.
    pub fn pre_run_cell(&self, info: &CellInfo) {
        let name = format!("{}.txt", Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"));
        let path = self.log_dir.join(name);
        if let Err(err) = std::fs::write(&path, &info.raw_cell) {
            debug!("cell log write failed for {:?}: {}", path, err);
        }
    }

    /// Registers the logger's pre-run hook with the engine's event bus.
    pub fn register(self, bus: &mut dyn CellEventBus) {
        bus.on_pre_run_cell(Box::new(move |info| self.pre_run_cell(info)));
    }
}
