//! The telemetry collector for notebook cell executions.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        CellTracker                         │
//! │   pre_run_cell / post_run_cell          (engine thread)    │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  ┌──────────────┐   metadata resolver ──┐  (worker         │
//! │  │ SharedRecord │◄── version scanner  ──┤   threads)       │
//! │  │ (fixed       │◄── watchdog         ──┘                  │
//! │  │  schema)     │    snapshotter ──► code cell list        │
//! │  └──────┬───────┘                                          │
//! │         ▼                                                  │
//! │   sanitize ─► encode ─► RecordSink (one record per cell)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The tracker attaches once per session, derives per-cell fields in the
//! hooks, and lets the workers overwrite the slowly-changing fields
//! asynchronously (last write wins, per field). Everything is fail-open:
//! a disabled or broken collector leaves the notebook untouched.

mod config;
pub mod mock;
mod parse;
mod record;
mod sanitize;
mod tracker;
pub mod traits;
mod workers;

pub use config::TrackerConfig;
pub use parse::compile_time_seconds;
pub use record::{EventRecord, FrameworkVersion, SharedRecord};
pub use sanitize::{encode_event, redact_secrets, sanitize_event};
pub use tracker::{
    CellEventBus, CellInfo, CellResult, CellTracker, DEACTIVATION_COMMAND, PostRunHook, PreRunHook,
};
pub use traits::{FileSystem, RealFs};
