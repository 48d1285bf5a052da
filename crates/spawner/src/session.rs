//! Per-user session state
//!
//! One record per user, owned by the lifecycle controller. The record is
//! created on the first spawn request and deleted (not just marked
//! Stopped) once the cluster resources are confirmed gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ImageReference;
use crate::identity::UserIdentity;

/// Lifecycle phase of one user's lab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Phase {
    /// Terminal phases free the user key for a future spawn
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Pending => "Pending",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a lab is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserRequested,
    IdleCulled,
    Evicted,
}

impl StopReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::IdleCulled => "idle_culled",
            Self::Evicted => "evicted",
        }
    }
}

/// The per-user session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub identity: UserIdentity,
    pub phase: Phase,
    /// Deterministic pod name; the cluster handle
    pub pod_name: String,
    pub pod_uid: Option<String>,
    pub pod_ip: Option<String>,
    pub image: ImageReference,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Updated by [`SessionState::touch`]; drives idle culling
    pub last_activity_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(identity: UserIdentity, image: ImageReference, pod_name: String) -> Self {
        let now = Utc::now();
        Self {
            identity,
            phase: Phase::Idle,
            pod_name,
            pod_uid: None,
            pod_ip: None,
            image,
            last_error: None,
            created_at: now,
            last_transition_at: now,
            last_activity_at: now,
        }
    }

    /// Apply a phase transition, stamping the transition time
    pub fn transition(&mut self, phase: Phase) {
        self.phase = phase;
        self.last_transition_at = Utc::now();
    }

    /// Record user activity for the idle-cull sweep
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub const fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
