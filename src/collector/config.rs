//! Environment-derived collector configuration.
//!
//! All knobs come from the hosting platform's environment: the eligibility
//! tier, the delivery stream, and the notebook/cluster identity. Values are
//! resolved once at attach time; the rest of the crate works from this
//! struct and never touches the environment again.

use std::path::PathBuf;
use std::time::Duration;

/// Service region the delivery stream lives in.
pub const REGION: &str = "eu-west-1";

/// Tier for which collection is enabled.
const ELIGIBLE_TIER: &str = "FREE";

const DEFAULT_STREAM_NAME: &str = "paperspacenotebook_production";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Resolved collector configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Platform tier (`TIER_TYPE`); collection only runs on the free tier.
    pub tier_type: String,
    /// Delivery stream name (`FIREHOSE_STREAM_NAME`).
    pub stream_name: String,
    /// Service region for the ingestion endpoint.
    pub region: String,
    /// Raw platform notebook id (`PAPERSPACE_NOTEBOOK_ID`); never sent as-is,
    /// only salted and hashed.
    pub notebook_id: String,
    /// Notebook repository id (`PAPERSPACE_NOTEBOOK_REPO_ID`).
    pub notebook_repo_id: String,
    /// Cluster id (`PAPERSPACE_CLUSTER_ID`).
    pub cluster_id: String,
    /// Framework the notebook repository declares (`REPO_FRAMEWORK`).
    pub repo_framework: String,
    /// Path of the running notebook document, as hinted by the session
    /// environment (`JPY_SESSION_NAME`).
    pub session_path: Option<PathBuf>,
    /// Directory holding the credential file (`CELLWATCH_CONFIG`).
    pub credentials_dir: Option<PathBuf>,
    /// Override for the site-packages directory the version scanner probes
    /// (`CELLWATCH_SITE_PACKAGES`).
    pub site_packages: Option<PathBuf>,
    /// Termination watchdog polling interval.
    pub poll_interval: Duration,
}

impl TrackerConfig {
    /// Resolves the configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            tier_type: std::env::var("TIER_TYPE").unwrap_or_else(|_| "UNKNOWN".to_string()),
            stream_name: std::env::var("FIREHOSE_STREAM_NAME")
                .unwrap_or_else(|_| DEFAULT_STREAM_NAME.to_string()),
            notebook_id: std::env::var("PAPERSPACE_NOTEBOOK_ID").unwrap_or_default(),
            notebook_repo_id: std::env::var("PAPERSPACE_NOTEBOOK_REPO_ID").unwrap_or_default(),
            cluster_id: std::env::var("PAPERSPACE_CLUSTER_ID").unwrap_or_default(),
            repo_framework: std::env::var("REPO_FRAMEWORK").unwrap_or_default(),
            session_path: std::env::var("JPY_SESSION_NAME").ok().map(PathBuf::from),
            credentials_dir: std::env::var("CELLWATCH_CONFIG").ok().map(PathBuf::from),
            site_packages: std::env::var("CELLWATCH_SITE_PACKAGES").ok().map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Whether this session's tier is eligible for collection.
    pub fn is_eligible(&self) -> bool {
        self.tier_type == ELIGIBLE_TIER
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tier_type: "UNKNOWN".to_string(),
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            region: REGION.to_string(),
            notebook_id: String::new(),
            notebook_repo_id: String::new(),
            cluster_id: String::new(),
            repo_framework: String::new(),
            session_path: None,
            credentials_dir: None,
            site_packages: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}
