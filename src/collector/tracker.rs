//! The cell tracker: lifecycle hooks, shared state, and session control.
//!
//! One `CellTracker` exists per notebook session. The notebook engine calls
//! [`CellTracker::pre_run_cell`] and [`CellTracker::post_run_cell`] around
//! every cell execution; four background worker threads fill in the
//! slowly-changing record fields independently. The tracker state machine is
//! `Enabled -> Disabled`, terminal: once disabled (ineligible tier, failed
//! setup, explicit detach, or the deactivation command) every entry point
//! no-ops for the rest of the session.
//!
//! Nothing here may propagate an error or a panic to the engine - cell
//! results are returned to the user whatever telemetry does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::config::TrackerConfig;
use super::record::SharedRecord;
use super::sanitize;
use super::traits::{FileSystem, RealFs};
use super::{parse, workers};
use crate::ingest::{FirehoseClient, RecordSink, load_credentials};

/// Cell command that turns collection off for the rest of the session.
pub const DEACTIVATION_COMMAND: &str = "unload_ext cellwatch";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Truncation length of the per-session anonymized user id.
const ONETIME_ID_LEN: usize = 12;

/// Total time detach spends waiting for workers before giving up on them.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Collector session state. Terminal at `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogState {
    Enabled,
    Disabled,
}

/// One-way state cell shared with the workers. There is deliberately no way
/// back from `Disabled`.
#[derive(Debug)]
pub(crate) struct StateCell {
    disabled: AtomicBool,
}

impl StateCell {
    pub fn new(initial: LogState) -> Self {
        Self {
            disabled: AtomicBool::new(initial == LogState::Disabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }
}

/// Execution info handed to the pre-run hook.
#[derive(Debug, Clone)]
pub struct CellInfo {
    /// Raw source of the cell about to run.
    pub raw_cell: String,
}

/// Execution result handed to the post-run hook.
#[derive(Debug, Clone, Default)]
pub struct CellResult {
    /// Raw source of the cell that ran.
    pub raw_cell: String,
    /// Textual result/output of the cell.
    pub output: String,
    /// Error raised before execution started (e.g. a syntax error), if any.
    pub error_before_exec: Option<String>,
    /// Error raised during execution, if any.
    pub error_in_exec: Option<String>,
}

impl CellResult {
    fn error_text(&self) -> Option<&str> {
        self.error_before_exec
            .as_deref()
            .or(self.error_in_exec.as_deref())
    }
}

pub type PreRunHook = Box<dyn Fn(&CellInfo) + Send + Sync>;
pub type PostRunHook = Box<dyn Fn(&CellResult) + Send + Sync>;

/// Registration surface of the notebook engine's event bus. The engine
/// invokes the registered hooks synchronously around every cell execution.
pub trait CellEventBus {
    fn on_pre_run_cell(&mut self, hook: PreRunHook);
    fn on_post_run_cell(&mut self, hook: PostRunHook);
}

/// The telemetry collector for one notebook session.
pub struct CellTracker {
    state: Arc<StateCell>,
    shutdown: Arc<AtomicBool>,
    record: SharedRecord,
    code_cells: Arc<Mutex<Vec<String>>>,
    sink: Option<Box<dyn RecordSink>>,
    created_at: DateTime<Utc>,
    config: TrackerConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CellTracker {
    /// Attaches the process-wide tracker to the engine's event bus.
    ///
    /// Idempotent: the first call builds the singleton from the environment
    /// and registers the hooks; later calls return the same instance
    /// unchanged (no duplicate workers, hooks, or disclosure). If the
    /// session is ineligible or setup fails, the returned instance is
    /// permanently disabled and every hook is a no-op - telemetry failure
    /// never blocks notebook execution.
    pub fn attach(bus: &mut dyn CellEventBus) -> Arc<CellTracker> {
        static INSTANCE: OnceLock<Arc<CellTracker>> = OnceLock::new();

        let mut created = false;
        let tracker = Arc::clone(INSTANCE.get_or_init(|| {
            created = true;
            CellTracker::start_from_env()
        }));

        if created {
            let hook_target = Arc::clone(&tracker);
            bus.on_pre_run_cell(Box::new(move |info| hook_target.pre_run_cell(info)));
            let hook_target = Arc::clone(&tracker);
            bus.on_post_run_cell(Box::new(move |result| hook_target.post_run_cell(result)));
        }

        tracker
    }

    fn start_from_env() -> Arc<CellTracker> {
        let config = TrackerConfig::from_env();

        if !config.is_eligible() {
            debug!("collection disabled: tier '{}' is not eligible", config.tier_type);
            return Self::disabled(config);
        }

        let Some(credentials_dir) = config.credentials_dir.clone() else {
            debug!("collection disabled: no credential directory configured");
            return Self::disabled(config);
        };
        let credentials = match load_credentials(&credentials_dir) {
            Ok(credentials) => credentials,
            Err(err) => {
                debug!("collection disabled: {}", err);
                return Self::disabled(config);
            }
        };

        let client = FirehoseClient::new(credentials, &config.region, &config.stream_name);
        let tracker = Self::with_parts(config, RealFs::new(), Box::new(client));

        print_disclosure();

        let shutdown = Arc::clone(&tracker.shutdown);
        if let Err(err) = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst)) {
            warn!("failed to install teardown handler: {}", err);
        }

        tracker
    }

    /// Builds an enabled tracker from explicit parts. This is the embedder
    /// and test entry point: no environment reads, no global registration,
    /// no disclosure. Workers are spawned immediately.
    pub fn with_parts<F>(config: TrackerConfig, fs: F, sink: Box<dyn RecordSink>) -> Arc<CellTracker>
    where
        F: FileSystem + Clone + Send + Sync + 'static,
    {
        Self::start(config, fs, sink, Utc::now())
    }

    fn start<F>(
        config: TrackerConfig,
        fs: F,
        sink: Box<dyn RecordSink>,
        created_at: DateTime<Utc>,
    ) -> Arc<CellTracker>
    where
        F: FileSystem + Clone + Send + Sync + 'static,
    {
        let tracker = Arc::new(CellTracker {
            state: Arc::new(StateCell::new(LogState::Enabled)),
            shutdown: Arc::new(AtomicBool::new(false)),
            record: SharedRecord::new(),
            code_cells: Arc::new(Mutex::new(Vec::new())),
            sink: Some(sink),
            created_at,
            config,
            workers: Mutex::new(Vec::new()),
        });

        tracker.record.lock().user_onetime_id =
            workers::anonymized_token(&format_timestamp(created_at), ONETIME_ID_LEN);

        tracker.spawn_workers(fs);
        tracker
    }

    fn disabled(config: TrackerConfig) -> Arc<CellTracker> {
        Arc::new(CellTracker {
            state: Arc::new(StateCell::new(LogState::Disabled)),
            shutdown: Arc::new(AtomicBool::new(false)),
            record: SharedRecord::new(),
            code_cells: Arc::new(Mutex::new(Vec::new())),
            sink: None,
            created_at: Utc::now(),
            config,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Whether the tracker is still collecting.
    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    fn spawn_workers<F>(&self, fs: F)
    where
        F: FileSystem + Clone + Send + Sync + 'static,
    {
        let mut handles = self.worker_handles();

        // Notebook metadata resolver.
        {
            let state = Arc::clone(&self.state);
            let record = self.record.clone();
            let config = self.config.clone();
            handles.push(std::thread::spawn(move || {
                if !state.is_enabled() {
                    return;
                }
                match workers::resolve_notebook_metadata(&config, Utc::now().date_naive()) {
                    Ok(metadata) => {
                        if state.is_enabled() {
                            metadata.apply(&mut record.lock());
                        }
                    }
                    Err(err) => debug!("notebook metadata unavailable: {}", err),
                }
            }));
        }

        // Framework version scanner.
        {
            let state = Arc::clone(&self.state);
            let record = self.record.clone();
            let fs = fs.clone();
            let site_override = self.config.site_packages.clone();
            handles.push(std::thread::spawn(move || {
                if !state.is_enabled() {
                    return;
                }
                let Some(site) = workers::locate_site_packages(&fs, site_override.as_deref())
                else {
                    debug!("site-packages not found; framework versions unreported");
                    return;
                };
                match workers::scan_framework_versions(&fs, &site) {
                    Ok(versions) => {
                        if state.is_enabled() {
                            let mut record = record.lock();
                            for (prefix, version) in &versions {
                                record.set_framework_version(prefix, version);
                            }
                        }
                    }
                    Err(err) => debug!("framework version scan failed: {}", err),
                }
            }));
        }

        // Initial cell-state snapshotter.
        {
            let state = Arc::clone(&self.state);
            let code_cells = Arc::clone(&self.code_cells);
            let fs = fs.clone();
            let notebook_path = self.config.session_path.clone();
            handles.push(std::thread::spawn(move || {
                if !state.is_enabled() {
                    return;
                }
                let Some(path) = notebook_path else {
                    debug!("no notebook document to snapshot");
                    return;
                };
                match workers::snapshot_code_cells(&fs, &path) {
                    Ok(sources) => {
                        if state.is_enabled() {
                            code_cells
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .extend(sources);
                        }
                    }
                    Err(err) => debug!("cell snapshot failed: {}", err),
                }
            }));
        }

        // Termination watchdog.
        {
            let state = Arc::clone(&self.state);
            let shutdown = Arc::clone(&self.shutdown);
            let record = self.record.clone();
            let interval = self.config.poll_interval;
            handles.push(std::thread::spawn(move || {
                workers::termination_watchdog(state, shutdown, record, interval)
            }));
        }
    }

    /// Runs just before a cell executes.
    pub fn pre_run_cell(&self, _info: &CellInfo) {
        if !self.state.is_enabled() {
            return;
        }
        self.record.lock().execution_start_time = format_timestamp(Utc::now());
    }

    /// Runs just after a cell executes: derives the per-cell fields,
    /// sanitizes a copy of the record, and delivers it. Best-effort
    /// throughout; delivery failures are logged and dropped.
    pub fn post_run_cell(&self, result: &CellResult) {
        if !self.state.is_enabled() {
            return;
        }

        let mut event = self.record.snapshot();

        event.execution_end_time = format_timestamp(Utc::now());
        event.code_executed.clone_from(&result.raw_cell);
        event.cell_output.clone_from(&result.output);
        event.compile_time_seconds = parse::compile_time_seconds(&result.output);
        event.cell_code_modified = self.detect_cell_modification(&result.raw_cell);

        match result.error_text() {
            Some(trace) => {
                event.event_type = "error".to_string();
                event.error_trace = trace.to_string();
                // Time to first error is computed once per session and kept.
                let elapsed = (Utc::now() - self.created_at).num_seconds();
                let mut shared = self.record.lock();
                if shared.time_to_first_error_seconds == 0 {
                    shared.time_to_first_error_seconds = elapsed;
                }
                event.time_to_first_error_seconds = shared.time_to_first_error_seconds;
            }
            None => {
                event.event_type = "success".to_string();
                event.error_trace = String::new();
            }
        }

        let deactivated = result.raw_cell.contains(DEACTIVATION_COMMAND);
        event.manual_logging_termination_event = i64::from(deactivated);

        event.event_time = format_timestamp(Utc::now());
        sanitize::sanitize_event(&mut event);

        match sanitize::encode_event(&event) {
            Ok(payload) => {
                if let Some(sink) = &self.sink {
                    if let Err(err) = sink.put_record(&payload) {
                        debug!("record delivery failed: {}", err);
                    }
                }
            }
            Err(err) => debug!("record encoding failed: {}", err),
        }

        if deactivated {
            self.detach();
        }
    }

    /// 0 when the executed source matches a snapshotted cell (or no snapshot
    /// exists), 1 when it differs. Exact string equality only.
    fn detect_cell_modification(&self, executed: &str) -> i64 {
        let cells = self.code_cells.lock().unwrap_or_else(PoisonError::into_inner);
        if cells.is_empty() {
            return 0;
        }
        i64::from(!cells.iter().any(|cell| cell == executed))
    }

    /// Disables the tracker for good and stops the workers.
    ///
    /// Cooperative: workers notice the shutdown signal at their next check;
    /// each is joined until the shared timeout runs out, after which the
    /// stragglers are left to finish on their own (their writes are already
    /// no-ops).
    pub fn detach(&self) {
        self.state.disable();
        self.shutdown.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self.worker_handles().drain(..).collect();
        let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("worker did not stop within the join timeout");
            }
        }
    }

    fn worker_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn print_disclosure() {
    println!(
        "\n====================================================================\n\
         This notebook collects anonymized information about the code being\n\
         run and the environment it runs on, to improve usability and support\n\
         for future users.\n\n\
         You can disable this at any time by running `%unload_ext cellwatch`\n\
         from any cell.\n\n\
         Unless collection is disabled, the following is recorded:\n\
         \t- User progression through the notebook\n\
         \t- Notebook details: code being run and the output of the cells\n\
         \t- ML application details: framework versions and compilation time\n\
         \t- Environment details\n\
         ====================================================================\n"
    );
}
