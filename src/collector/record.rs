//! Fixed-schema telemetry event record shared between hooks and workers.
//!
//! One `EventRecord` conceptually represents "the current cell's execution
//! event". Hooks and background workers overwrite individual fields in place;
//! a copy of the whole record is delivered once per cell execution. Every
//! field is always present with its type's zero/empty default - the wire
//! schema never has absent or null keys, regardless of which workers managed
//! to run.
//!
//! Field declaration order is the wire key order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// The telemetry event schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventRecord {
    // Timing data
    pub event_time: String,
    pub execution_start_time: String,
    pub execution_end_time: String,
    pub time_to_first_error_seconds: i64,
    pub compile_time_seconds: i64,
    // Event metadata
    pub event_type: String,
    pub user_onetime_id: String,
    pub manual_logging_termination_event: i64,
    pub manual_cell_termination_event: i64,
    // Largely constant values
    pub notebook_path: String,
    pub notebook_name: String,
    pub notebook_repo_id: String,
    pub notebook_id: String,
    pub cluster_id: String,
    pub repo_framework: String,
    // Cell input/output information
    pub error_trace: String,
    pub cell_output: String,
    pub code_executed: String,
    pub cell_code_modified: i64,
    // Major framework versions from the environment
    pub poptorch_version_major: i64,
    pub poptorch_version_minor: i64,
    pub poptorch_version_patch: String,
    pub torch_version_major: i64,
    pub torch_version_minor: i64,
    pub torch_version_patch: String,
    pub transformers_version_major: i64,
    pub transformers_version_minor: i64,
    pub transformers_version_patch: String,
    pub tensorflow_version_major: i64,
    pub tensorflow_version_minor: i64,
    pub tensorflow_version_patch: String,
    pub popgeometric_version_major: i64,
    pub popgeometric_version_minor: i64,
    pub popgeometric_version_patch: String,
}

impl EventRecord {
    /// Writes one tracked framework's version triple. `prefix` is the schema
    /// field prefix (e.g. `torch`, `popgeometric`); unknown prefixes are
    /// ignored.
    pub fn set_framework_version(&mut self, prefix: &str, version: &FrameworkVersion) {
        let (major, minor, patch) = match prefix {
            "poptorch" => (
                &mut self.poptorch_version_major,
                &mut self.poptorch_version_minor,
                &mut self.poptorch_version_patch,
            ),
            "torch" => (
                &mut self.torch_version_major,
                &mut self.torch_version_minor,
                &mut self.torch_version_patch,
            ),
            "transformers" => (
                &mut self.transformers_version_major,
                &mut self.transformers_version_minor,
                &mut self.transformers_version_patch,
            ),
            "tensorflow" => (
                &mut self.tensorflow_version_major,
                &mut self.tensorflow_version_minor,
                &mut self.tensorflow_version_patch,
            ),
            "popgeometric" => (
                &mut self.popgeometric_version_major,
                &mut self.popgeometric_version_minor,
                &mut self.popgeometric_version_patch,
            ),
            _ => return,
        };
        *major = version.major;
        *minor = version.minor;
        patch.clone_from(&version.patch);
    }

    /// Applies `f` to every string-valued field.
    pub fn visit_strings_mut(&mut self, mut f: impl FnMut(&mut String)) {
        for field in [
            &mut self.event_time,
            &mut self.execution_start_time,
            &mut self.execution_end_time,
            &mut self.event_type,
            &mut self.user_onetime_id,
            &mut self.notebook_path,
            &mut self.notebook_name,
            &mut self.notebook_repo_id,
            &mut self.notebook_id,
            &mut self.cluster_id,
            &mut self.repo_framework,
            &mut self.error_trace,
            &mut self.cell_output,
            &mut self.code_executed,
            &mut self.poptorch_version_patch,
            &mut self.torch_version_patch,
            &mut self.transformers_version_patch,
            &mut self.tensorflow_version_patch,
            &mut self.popgeometric_version_patch,
        ] {
            f(field);
        }
    }
}

/// A `major.minor.patch` triple parsed from a package version string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameworkVersion {
    pub major: i64,
    pub minor: i64,
    pub patch: String,
}

impl FrameworkVersion {
    /// Parses a dotted version string. Missing or non-numeric components
    /// degrade to the schema defaults (0 / 0 / "") rather than erroring;
    /// only the third component is kept for `patch`.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let patch = parts.next().unwrap_or("").to_string();
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// The event record shared by the lifecycle hooks and all background
/// workers. Updates are last-write-wins per field; the mutex absorbs
/// poisoning so a panicking writer can never take down a hook.
#[derive(Clone, Default)]
pub struct SharedRecord {
    inner: Arc<Mutex<EventRecord>>,
}

impl SharedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the record for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, EventRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the current record.
    pub fn snapshot(&self) -> EventRecord {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA_KEYS: [&str; 34] = [
        "event_time",
        "execution_start_time",
        "execution_end_time",
        "time_to_first_error_seconds",
        "compile_time_seconds",
        "event_type",
        "user_onetime_id",
        "manual_logging_termination_event",
        "manual_cell_termination_event",
        "notebook_path",
        "notebook_name",
        "notebook_repo_id",
        "notebook_id",
        "cluster_id",
        "repo_framework",
        "error_trace",
        "cell_output",
        "code_executed",
        "cell_code_modified",
        "poptorch_version_major",
        "poptorch_version_minor",
        "poptorch_version_patch",
        "torch_version_major",
        "torch_version_minor",
        "torch_version_patch",
        "transformers_version_major",
        "transformers_version_minor",
        "transformers_version_patch",
        "tensorflow_version_major",
        "tensorflow_version_minor",
        "tensorflow_version_patch",
        "popgeometric_version_major",
        "popgeometric_version_minor",
        "popgeometric_version_patch",
    ];

    #[test]
    fn default_record_serializes_exactly_the_schema() {
        let json = serde_json::to_value(EventRecord::default()).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), SCHEMA_KEYS.len());
        for key in SCHEMA_KEYS {
            assert!(object.contains_key(key), "schema key {key} missing");
            // Every field carries its zero/empty default, never null.
            assert!(!object[key].is_null());
        }
        assert_eq!(object["event_type"], "");
        assert_eq!(object["compile_time_seconds"], 0);
        assert_eq!(object["cell_code_modified"], 0);
        assert_eq!(object["torch_version_patch"], "");
    }

    #[test]
    fn wire_encoding_keeps_schema_key_order() {
        // The wire format serializes struct fields in declaration order;
        // scan the encoded text to pin it.
        let text = serde_json::to_string(&EventRecord::default()).unwrap();
        let mut last = 0;
        for key in SCHEMA_KEYS {
            let needle = format!("\"{key}\":");
            let position = text.find(&needle).unwrap_or_else(|| panic!("{key} not encoded"));
            assert!(position >= last, "schema key {key} encoded out of order");
            last = position;
        }
    }

    #[test]
    fn framework_version_parsing() {
        assert_eq!(
            FrameworkVersion::parse("2.1.0"),
            FrameworkVersion {
                major: 2,
                minor: 1,
                patch: "0".to_string()
            }
        );
        // Two components: patch stays empty.
        assert_eq!(
            FrameworkVersion::parse("2.1"),
            FrameworkVersion {
                major: 2,
                minor: 1,
                patch: String::new()
            }
        );
        // Post-release tails beyond the third component are dropped.
        assert_eq!(FrameworkVersion::parse("4.36.2.post1").patch, "2");
        // Garbage degrades to defaults.
        assert_eq!(FrameworkVersion::parse(""), FrameworkVersion::default());
        assert_eq!(FrameworkVersion::parse("dev"), FrameworkVersion::default());
    }

    #[test]
    fn set_framework_version_targets_the_right_fields() {
        let mut record = EventRecord::default();
        let version = FrameworkVersion::parse("3.3.0");
        record.set_framework_version("popgeometric", &version);
        assert_eq!(record.popgeometric_version_major, 3);
        assert_eq!(record.popgeometric_version_minor, 3);
        assert_eq!(record.popgeometric_version_patch, "0");
        assert_eq!(record.torch_version_major, 0);

        // Unknown prefixes are ignored.
        record.set_framework_version("flax", &version);
        assert_eq!(record, {
            let mut expected = EventRecord::default();
            expected.set_framework_version("popgeometric", &version);
            expected
        });
    }

    #[test]
    fn shared_record_is_clone_coherent() {
        let shared = SharedRecord::new();
        let alias = shared.clone();
        alias.lock().cell_code_modified = 1;
        assert_eq!(shared.snapshot().cell_code_modified, 1);
    }
}
