//! Configuration for the spawner core
//!
//! Reads config from ~/.config/labpod/config.toml

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Full spawner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnerConfig {
    /// Kubernetes namespace for lab pods
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Image catalog endpoint (cachemachine-style JSON)
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,

    /// Catalog refresh interval in seconds
    #[serde(default = "default_catalog_refresh")]
    pub catalog_refresh_secs: u64,

    /// Timeout and retry knobs
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Named lab sizes selectable in a profile
    #[serde(default = "default_sizes")]
    pub sizes: HashMap<String, LabSize>,

    /// Default PVC storage request for profile volumes without a claim
    #[serde(default = "default_storage_size")]
    pub storage_size: String,

    /// Storage class for created PVCs
    #[serde(default)]
    pub storage_class: Option<String>,

    /// Idle timeout before a running lab is culled, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum concurrent lab sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Extra labels applied to every created object
    #[serde(default)]
    pub extra_labels: HashMap<String, String>,
}

/// Timeouts and retry budgets for cluster interaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Hard deadline for Pending -> Running, in seconds
    #[serde(default = "default_start_deadline")]
    pub start_deadline_secs: u64,

    /// How long an image pull may back off before giving up, in seconds
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    /// Deadline for a stopped pod to actually disappear, in seconds
    #[serde(default = "default_stop_deadline")]
    pub stop_deadline_secs: u64,

    /// Per cluster API call timeout, in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Base delay between status polls, in milliseconds
    #[serde(default = "default_poll_base")]
    pub poll_base_ms: u64,

    /// Cap on the backed-off poll delay, in milliseconds
    #[serde(default = "default_poll_cap")]
    pub poll_cap_ms: u64,

    /// Consecutive transient-error budget before giving up
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

/// The cpu and ram settings for one lab size preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabSize {
    /// Number of virtual CPUs, e.g. "1" or "500m"
    pub cpu: String,
    /// Amount of memory with units, e.g. "2048M" or "3G"
    pub ram: String,
}

fn default_namespace() -> String {
    "labpod".to_string()
}

fn default_catalog_url() -> String {
    "http://cachemachine/jupyter/available".to_string()
}

const fn default_catalog_refresh() -> u64 {
    300
}

const fn default_start_deadline() -> u64 {
    600
}

const fn default_pull_timeout() -> u64 {
    300
}

const fn default_stop_deadline() -> u64 {
    120
}

const fn default_call_timeout() -> u64 {
    30
}

const fn default_poll_base() -> u64 {
    500
}

const fn default_poll_cap() -> u64 {
    10_000
}

const fn default_retry_attempts() -> u32 {
    5
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

const fn default_idle_timeout() -> u64 {
    3600
}

const fn default_max_sessions() -> usize {
    100
}

fn default_sizes() -> HashMap<String, LabSize> {
    let mut sizes = HashMap::new();
    sizes.insert(
        "small".to_string(),
        LabSize {
            cpu: "1".to_string(),
            ram: "3G".to_string(),
        },
    );
    sizes.insert(
        "medium".to_string(),
        LabSize {
            cpu: "2".to_string(),
            ram: "6G".to_string(),
        },
    );
    sizes.insert(
        "large".to_string(),
        LabSize {
            cpu: "4".to_string(),
            ram: "12G".to_string(),
        },
    );
    sizes
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start_deadline_secs: default_start_deadline(),
            pull_timeout_secs: default_pull_timeout(),
            stop_deadline_secs: default_stop_deadline(),
            call_timeout_secs: default_call_timeout(),
            poll_base_ms: default_poll_base(),
            poll_cap_ms: default_poll_cap(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            catalog_url: default_catalog_url(),
            catalog_refresh_secs: default_catalog_refresh(),
            timeouts: Timeouts::default(),
            sizes: default_sizes(),
            storage_size: default_storage_size(),
            storage_class: None,
            idle_timeout_secs: default_idle_timeout(),
            max_sessions: default_max_sessions(),
            extra_labels: HashMap::new(),
        }
    }
}

impl SpawnerConfig {
    /// Load configuration from the default path, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(&Self::default_config_path()).unwrap_or_default()
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("labpod")
            .join("config.toml")
    }

    /// Load from a specific TOML file
    pub fn load_from_path(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        toml::from_str(&content).ok()
    }

    pub const fn catalog_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_secs)
    }

    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Timeouts {
    pub const fn start_deadline(&self) -> Duration {
        Duration::from_secs(self.start_deadline_secs)
    }

    pub const fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub const fn stop_deadline(&self) -> Duration {
        Duration::from_secs(self.stop_deadline_secs)
    }

    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub const fn poll_base(&self) -> Duration {
        Duration::from_millis(self.poll_base_ms)
    }

    pub const fn poll_cap(&self) -> Duration {
        Duration::from_millis(self.poll_cap_ms)
    }
}
