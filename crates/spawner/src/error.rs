//! Spawn error taxonomy
//!
//! Every user-visible failure ends up as one of these variants; the
//! lifecycle controller retries transient cluster errors internally and
//! only surfaces an error once retrying can no longer help.

use thiserror::Error;

/// Errors surfaced by the spawn-orchestration core
#[derive(Debug, Error)]
pub enum SpawnError {
    /// No catalog snapshot has ever been fetched
    #[error("image catalog unavailable: no snapshot has been fetched yet")]
    CatalogUnavailable,

    /// The requested image/tag does not exist in the catalog
    #[error("image not found in catalog: {0}")]
    ImageNotFound(String),

    /// The spawn profile failed validation
    #[error("invalid spawn profile: {0}")]
    InvalidProfile(String),

    /// A live workload already exists for this user
    #[error("a lab workload already exists for user {0}")]
    SubmitConflict(String),

    /// The image could not be pulled before the pull deadline
    #[error("image pull did not complete before the deadline: {0}")]
    ImagePullTimeout(String),

    /// The pod disappeared before reaching Running (or during reconcile)
    #[error("lab workload vanished: {0}")]
    WorkloadVanished(String),

    /// The cluster rejected the request outright (RBAC, policy)
    #[error("spawn denied by cluster: {0}")]
    SpawnDenied(String),

    /// Namespace resource quota exceeded
    #[error("resource quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transient cluster errors persisted past the retry budget
    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// The Pending -> Running hard deadline expired
    #[error("lab did not reach Running before the start deadline ({0}s)")]
    StartDeadlineExceeded(u64),

    /// Anything else (wiring, serialization, client construction)
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SpawnError {
    /// Short stable reason string, used for metrics labels and progress
    /// events.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::CatalogUnavailable => "catalog_unavailable",
            Self::ImageNotFound(_) => "image_not_found",
            Self::InvalidProfile(_) => "invalid_profile",
            Self::SubmitConflict(_) => "submit_conflict",
            Self::ImagePullTimeout(_) => "image_pull_timeout",
            Self::WorkloadVanished(_) => "workload_vanished",
            Self::SpawnDenied(_) => "spawn_denied",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::StartDeadlineExceeded(_) => "start_deadline_exceeded",
            Self::Internal(_) => "internal",
        }
    }

    /// True for errors where retrying cannot change the outcome.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidProfile(_)
                | Self::ImageNotFound(_)
                | Self::SpawnDenied(_)
                | Self::QuotaExceeded(_)
                | Self::SubmitConflict(_)
        )
    }
}
