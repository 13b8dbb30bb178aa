//! Background workers that fill in the slowly-changing parts of the event
//! record.
//!
//! Four workers run on their own threads, started once at attach:
//! - metadata resolver: notebook identity fields, anonymized
//! - version scanner: tracked framework versions from site-packages
//! - termination watchdog: flags teardown while the session is live
//! - snapshotter: original source of every code cell, for modification
//!   detection
//!
//! Worker bodies are plain `Result`-returning functions; the thread wrappers
//! in the tracker are the one place that decides to drop an error and keep
//! the schema defaults. Each worker checks the log-state guard before
//! touching the shared record.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use chrono::NaiveDate;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::config::TrackerConfig;
use super::record::{EventRecord, FrameworkVersion, SharedRecord};
use super::tracker::StateCell;
use super::traits::FileSystem;

/// Sentinel stored as the notebook path when it cannot be resolved.
pub(crate) const NOTEBOOK_PATH_SENTINEL: &str = "failed-to-get-nb-path";

/// Truncation length of the anonymized notebook id.
const NOTEBOOK_ID_LEN: usize = 16;

/// How often the watchdog wakes up between shutdown checks.
const SHUTDOWN_CHECK_STEP: Duration = Duration::from_millis(100);

/// A framework whose installed version is reported in the event record.
pub(crate) struct TrackedFramework {
    /// Normalized distribution name as it appears in site-packages.
    pub package: &'static str,
    /// Schema field prefix for the version triple.
    pub prefix: &'static str,
}

pub(crate) const TRACKED_FRAMEWORKS: [TrackedFramework; 5] = [
    TrackedFramework {
        package: "poptorch",
        prefix: "poptorch",
    },
    TrackedFramework {
        package: "torch",
        prefix: "torch",
    },
    TrackedFramework {
        package: "transformers",
        prefix: "transformers",
    },
    TrackedFramework {
        package: "tensorflow",
        prefix: "tensorflow",
    },
    TrackedFramework {
        package: "poptorch-geometric",
        prefix: "popgeometric",
    },
];

/// Failure of a best-effort worker. The tracker logs these at debug level
/// and keeps the schema defaults; they are never surfaced.
#[derive(Debug)]
pub(crate) enum WorkerError {
    Io(std::io::Error),
    Parse(String),
    Unavailable(String),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Io(e) => write!(f, "I/O error: {}", e),
            WorkerError::Parse(msg) => write!(f, "parse error: {}", msg),
            WorkerError::Unavailable(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::Io(e)
    }
}

/// URL-safe base64 of the SHA-256 of `input`, truncated to `len` characters.
/// The basis of every anonymized identifier this crate emits.
pub(crate) fn anonymized_token(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    URL_SAFE.encode(digest).chars().take(len).collect()
}

/// Static notebook identity fields, resolved once per session.
#[derive(Debug, PartialEq)]
pub(crate) struct NotebookMetadata {
    pub path: String,
    pub name: String,
    pub repo_id: String,
    pub id: String,
    pub cluster_id: String,
    pub framework: String,
}

impl NotebookMetadata {
    pub fn apply(&self, record: &mut EventRecord) {
        record.notebook_path.clone_from(&self.path);
        record.notebook_name.clone_from(&self.name);
        record.notebook_repo_id.clone_from(&self.repo_id);
        record.notebook_id.clone_from(&self.id);
        record.cluster_id.clone_from(&self.cluster_id);
        record.repo_framework.clone_from(&self.framework);
    }
}

/// Resolves the notebook identity. The raw platform id is salted with the
/// current date before hashing, so the emitted id cannot be correlated
/// across days.
pub(crate) fn resolve_notebook_metadata(
    config: &TrackerConfig,
    today: NaiveDate,
) -> Result<NotebookMetadata, WorkerError> {
    if config.notebook_id.is_empty() {
        return Err(WorkerError::Unavailable(
            "notebook id not present in environment".to_string(),
        ));
    }

    let (path, name) = match &config.session_path {
        Some(path) => (
            path.display().to_string(),
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        None => (NOTEBOOK_PATH_SENTINEL.to_string(), String::new()),
    };

    let salted = format!("{}{}", config.notebook_id, today.format("%Y-%m-%d"));

    Ok(NotebookMetadata {
        path,
        name,
        repo_id: config.notebook_repo_id.clone(),
        id: anonymized_token(&salted, NOTEBOOK_ID_LEN),
        cluster_id: config.cluster_id.clone(),
        framework: config.repo_framework.clone(),
    })
}

/// Roots probed for an interpreter directory when no override is set.
const INTERPRETER_ROOTS: [&str; 3] = ["/usr/local/lib", "/usr/lib", "/opt/conda/lib"];

/// Finds the site-packages directory to scan: the configured override if it
/// exists, otherwise the first `python*/{site,dist}-packages` found under
/// the usual interpreter roots.
pub(crate) fn locate_site_packages<F: FileSystem>(
    fs: &F,
    override_path: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return fs.exists(path).then(|| path.to_path_buf());
    }

    for root in INTERPRETER_ROOTS {
        let Ok(entries) = fs.read_dir(Path::new(root)) else {
            continue;
        };
        for entry in entries {
            let is_interpreter = entry
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("python"));
            if !is_interpreter {
                continue;
            }
            for packages_dir in ["site-packages", "dist-packages"] {
                let candidate = entry.join(packages_dir);
                if fs.exists(&candidate) {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

/// Scans site-packages `*.dist-info` entries for the tracked frameworks.
/// Returns `(schema prefix, version)` pairs for the frameworks found;
/// frameworks not installed simply don't appear (their record fields keep
/// the 0/0/"" defaults).
pub(crate) fn scan_framework_versions<F: FileSystem>(
    fs: &F,
    site_packages: &Path,
) -> Result<Vec<(&'static str, FrameworkVersion)>, WorkerError> {
    let entries = fs.read_dir(site_packages)?;

    let mut found = Vec::new();
    for entry in entries {
        let Some(name) = entry.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".dist-info") else {
            continue;
        };
        // dist-info naming is `{distribution}-{version}`; the distribution
        // part uses underscores, so the last dash starts the version.
        let Some((distribution, version)) = stem.rsplit_once('-') else {
            continue;
        };
        let normalized = distribution.to_lowercase().replace('_', "-");
        if let Some(framework) = TRACKED_FRAMEWORKS
            .iter()
            .find(|framework| framework.package == normalized)
        {
            found.push((framework.prefix, FrameworkVersion::parse(version)));
        }
    }
    Ok(found)
}

#[derive(Deserialize)]
struct NotebookDoc {
    #[serde(default)]
    cells: Vec<NotebookCell>,
}

#[derive(Deserialize)]
struct NotebookCell {
    cell_type: String,
    #[serde(default)]
    source: CellSource,
}

/// Notebook cell source: either one string or a list of line strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum CellSource {
    Text(String),
    Lines(Vec<String>),
}

impl Default for CellSource {
    fn default() -> Self {
        CellSource::Text(String::new())
    }
}

impl CellSource {
    fn into_text(self) -> String {
        match self {
            CellSource::Text(text) => text,
            CellSource::Lines(lines) => lines.concat(),
        }
    }
}

/// Reads the notebook document and returns the original source of every
/// code cell, in order.
pub(crate) fn snapshot_code_cells<F: FileSystem>(
    fs: &F,
    notebook_path: &Path,
) -> Result<Vec<String>, WorkerError> {
    let contents = fs.read_to_string(notebook_path)?;
    let document: NotebookDoc =
        serde_json::from_str(&contents).map_err(|e| WorkerError::Parse(e.to_string()))?;

    Ok(document
        .cells
        .into_iter()
        .filter(|cell| cell.cell_type == "code")
        .map(|cell| cell.source.into_text())
        .collect())
}

/// Sleeps until the shutdown signal fires, then - if the session is still
/// live - records the teardown as a manual cell termination. A clean detach
/// disables the state first, so the final write degenerates to a no-op and
/// the record stops changing. Best-effort only: nothing guarantees the
/// flagged record is ever flushed after teardown.
pub(crate) fn termination_watchdog(
    state: Arc<StateCell>,
    shutdown: Arc<AtomicBool>,
    record: SharedRecord,
    interval: Duration,
) {
    loop {
        let mut remaining = interval;
        while remaining > Duration::ZERO {
            if shutdown.load(Ordering::SeqCst) {
                if state.is_enabled() {
                    record.lock().manual_cell_termination_event = 1;
                }
                return;
            }
            let step = remaining.min(SHUTDOWN_CHECK_STEP);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        if !state.is_enabled() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{DEMO_NOTEBOOK_PATH, MockFs, notebook_env};
    use crate::collector::tracker::LogState;

    fn eligible_config() -> TrackerConfig {
        TrackerConfig {
            tier_type: "FREE".to_string(),
            notebook_id: "nb-123456".to_string(),
            notebook_repo_id: "repo-7".to_string(),
            cluster_id: "cluster-3".to_string(),
            repo_framework: "pytorch".to_string(),
            session_path: Some(PathBuf::from("/notebooks/demo.ipynb")),
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn anonymized_token_is_stable_and_truncated() {
        let token = anonymized_token("nb-1232026-08-05", 16);
        assert_eq!(token.chars().count(), 16);
        assert_eq!(token, anonymized_token("nb-1232026-08-05", 16));
        assert_ne!(token, anonymized_token("nb-1232026-08-06", 16));
        // URL-safe alphabet only.
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn metadata_resolution_derives_name_and_salted_id() {
        let config = eligible_config();
        let today = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        let metadata = resolve_notebook_metadata(&config, today).unwrap();

        assert_eq!(metadata.path, "/notebooks/demo.ipynb");
        assert_eq!(metadata.name, "demo");
        assert_eq!(metadata.repo_id, "repo-7");
        assert_eq!(metadata.cluster_id, "cluster-3");
        assert_eq!(metadata.framework, "pytorch");
        assert_eq!(metadata.id, anonymized_token("nb-1234562026-08-05", 16));
        // The raw platform id never appears in the derived id.
        assert!(!metadata.id.contains("nb-123456"));
    }

    #[test]
    fn metadata_without_platform_id_is_unavailable() {
        let config = TrackerConfig {
            notebook_id: String::new(),
            ..eligible_config()
        };
        let today = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        assert!(resolve_notebook_metadata(&config, today).is_err());
    }

    #[test]
    fn metadata_without_session_path_uses_sentinel() {
        let config = TrackerConfig {
            session_path: None,
            ..eligible_config()
        };
        let today = NaiveDate::from_ymd_opt(2026, 8, 5).unwrap();
        let metadata = resolve_notebook_metadata(&config, today).unwrap();
        assert_eq!(metadata.path, NOTEBOOK_PATH_SENTINEL);
        assert_eq!(metadata.name, "");
    }

    #[test]
    fn site_packages_located_under_interpreter_roots() {
        let fs = notebook_env();
        let located = locate_site_packages(&fs, None).unwrap();
        assert_eq!(
            located,
            PathBuf::from("/opt/conda/lib/python3.10/site-packages")
        );

        // Override wins, but only if it exists.
        let override_path = Path::new("/custom/site-packages");
        assert_eq!(locate_site_packages(&fs, Some(override_path)), None);
        let mut fs = fs;
        fs.add_dir(override_path);
        assert_eq!(
            locate_site_packages(&fs, Some(override_path)),
            Some(override_path.to_path_buf())
        );
    }

    #[test]
    fn version_scan_reports_tracked_frameworks_only() {
        let fs = notebook_env();
        let site = Path::new("/opt/conda/lib/python3.10/site-packages");
        let mut versions = scan_framework_versions(&fs, site).unwrap();
        versions.sort_by_key(|(prefix, _)| *prefix);

        assert_eq!(
            versions,
            vec![
                ("popgeometric", FrameworkVersion::parse("3.3.0")),
                ("torch", FrameworkVersion::parse("2.1.0")),
                ("transformers", FrameworkVersion::parse("4.36.2")),
            ]
        );
    }

    #[test]
    fn version_scan_of_missing_directory_is_an_error() {
        let fs = MockFs::new();
        assert!(scan_framework_versions(&fs, Path::new("/site")).is_err());
    }

    #[test]
    fn snapshot_collects_code_cell_sources_in_order() {
        let fs = notebook_env();
        let cells = snapshot_code_cells(&fs, Path::new(DEMO_NOTEBOOK_PATH)).unwrap();
        assert_eq!(
            cells,
            vec![
                "x = 1\n".to_string(),
                "import torch\nprint(torch.__version__)\n".to_string(),
            ]
        );
    }

    #[test]
    fn snapshot_failures_are_errors_not_panics() {
        let fs = MockFs::new();
        assert!(snapshot_code_cells(&fs, Path::new("/missing.ipynb")).is_err());

        let mut fs = MockFs::new();
        fs.add_file("/broken.ipynb", "not json");
        assert!(snapshot_code_cells(&fs, Path::new("/broken.ipynb")).is_err());
    }

    #[test]
    fn watchdog_records_teardown_while_enabled() {
        let state = Arc::new(StateCell::new(LogState::Enabled));
        let shutdown = Arc::new(AtomicBool::new(false));
        let record = SharedRecord::new();

        let handle = std::thread::spawn({
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            let record = record.clone();
            move || termination_watchdog(state, shutdown, record, Duration::from_secs(10))
        });

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(record.snapshot().manual_cell_termination_event, 1);
    }

    #[test]
    fn watchdog_stays_silent_after_detach() {
        let state = Arc::new(StateCell::new(LogState::Enabled));
        state.disable();
        let shutdown = Arc::new(AtomicBool::new(true));
        let record = SharedRecord::new();

        termination_watchdog(
            Arc::clone(&state),
            shutdown,
            record.clone(),
            Duration::from_secs(10),
        );
        assert_eq!(record.snapshot().manual_cell_termination_event, 0);
    }
}
