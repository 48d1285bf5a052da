// labpod-spawner library
// Kubernetes-native lab spawning core for a multi-user notebook hub

// Error taxonomy
pub mod error;

// Configuration
pub mod config;

// User identity and groups
pub mod identity;

// Image catalog: tag conventions, resolution, cached HTTP client
pub mod catalog;

// Spawn profiles and resource sizing
pub mod profile;

// Workload construction (pod, PVCs, environment ConfigMap)
pub mod builder;

// Cluster access seam
pub mod cluster;

// Session records and the lifecycle state machine phases
pub mod session;

// Per-user locking and session bookkeeping
pub mod registry;

// Progress event fan-out
pub mod events;

// Spawn/stop/reconcile driving logic
pub mod lifecycle;

// Prometheus metrics
pub mod metrics;

// The facade the hub talks to
pub mod spawner;

/// Install the default tracing subscriber
///
/// Binaries embedding the spawner call this once at startup; repeated
/// calls are harmless.
pub fn init_tracing() {
    tracing_subscriber::fmt().with_target(false).try_init().ok();
}

pub use catalog::{CatalogClient, CatalogSnapshot, ImageClass, ImageReference, ImageSelection};
pub use config::SpawnerConfig;
pub use error::SpawnError;
pub use events::{EventStream, ProgressEvent};
pub use identity::{Group, UserIdentity};
pub use profile::{Sizing, SpawnProfile, VolumeSpec};
pub use session::{Phase, SessionState, StopReason};
pub use spawner::Spawner;
