//! Spawner facade
//!
//! The entry points the hub invokes: spawn, stop, status. Wires the
//! catalog, builder, registry, events, and lifecycle controller
//! together, and owns the background tasks (catalog refresh, idle
//! cull).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::builder;
use crate::catalog::{CatalogClient, ImageSelection};
use crate::cluster::{ClusterApi, KubeCluster};
use crate::config::SpawnerConfig;
use crate::error::SpawnError;
use crate::events::{EventReporter, EventStream, ProgressEvent};
use crate::identity::UserIdentity;
use crate::lifecycle::LifecycleController;
use crate::metrics;
use crate::profile::SpawnProfile;
use crate::registry::SessionRegistry;
use crate::session::{Phase, SessionState, StopReason};

/// The spawn-orchestration core
pub struct Spawner {
    config: SpawnerConfig,
    catalog: Arc<CatalogClient>,
    registry: Arc<SessionRegistry>,
    events: Arc<EventReporter>,
    controller: Arc<LifecycleController>,
}

impl Spawner {
    /// Connect to the cluster with the default client
    pub async fn connect(config: SpawnerConfig) -> anyhow::Result<Self> {
        let cluster = Arc::new(KubeCluster::connect(&config.namespace).await?);
        Ok(Self::with_cluster(config, cluster))
    }

    /// Build against any cluster implementation (tests use a mock)
    pub fn with_cluster(config: SpawnerConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let events = Arc::new(EventReporter::new());
        let controller = Arc::new(LifecycleController::new(
            config.clone(),
            cluster,
            Arc::clone(&registry),
            Arc::clone(&events),
        ));
        let catalog = Arc::new(CatalogClient::new(config.catalog_url.clone()));
        Self {
            config,
            catalog,
            registry,
            events,
            controller,
        }
    }

    /// The catalog client, for snapshot injection and direct queries
    pub fn catalog(&self) -> &Arc<CatalogClient> {
        &self.catalog
    }

    /// Begin periodic catalog refresh
    pub fn start_catalog_refresh(&self) -> JoinHandle<()> {
        self.catalog
            .start_refresh_task(self.config.catalog_refresh_interval())
    }

    /// Begin the periodic idle-cull sweep
    pub fn start_idle_culler(self: &Arc<Self>) -> JoinHandle<()> {
        let spawner = Arc::clone(self);
        // Sweep at a fraction of the timeout so culls land promptly
        let interval = Duration::from_secs((self.config.idle_timeout_secs / 4).max(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let culled = spawner.cull_idle().await;
                if culled > 0 {
                    info!(count = culled, "Culled idle labs");
                }
            }
        })
    }

    /// Spawn a lab for a user
    ///
    /// Validation, image resolution, and the conflict check happen
    /// before this returns; the cluster work then runs in a background
    /// task under the user's lock, reported through the returned event
    /// stream. The terminal event carries Running or the failure
    /// reason.
    pub async fn spawn(
        &self,
        identity: UserIdentity,
        selection: ImageSelection,
        profile: SpawnProfile,
    ) -> Result<EventStream, SpawnError> {
        profile.validate(&self.config.sizes)?;
        let image = self.catalog.resolve(&selection).await?;
        let spec = builder::build(&identity, &image, &profile, &self.config)?;

        let username = identity.username.clone();
        if let Some(existing) = self.registry.get(&username).await {
            if !existing.is_terminal() {
                return Err(SpawnError::SubmitConflict(username));
            }
        }
        // The guard travels into the background task, so the user stays
        // locked from before the record exists until the spawn settles.
        // An operation already holding the lock is a conflict, not
        // something to queue behind.
        let Some(guard) = self.registry.try_lock_user(&username) else {
            return Err(SpawnError::SubmitConflict(username));
        };

        // Token before record: any stop that can see the record can
        // cancel this spawn.
        let cancel = self.controller.register_cancel(&username);
        let mut session = SessionState::new(identity.clone(), image.clone(), spec.pod_name().to_string());
        session.transition(Phase::Pending);
        if let Err(e) = self.registry.insert(session).await {
            self.controller.clear_cancel(&username);
            return Err(e);
        }
        metrics::SPAWNS_TOTAL.inc();
        metrics::ACTIVE_SESSIONS.set(self.registry.len().await as i64);

        // A fresh attempt must not replay a prior attempt's events
        self.events.reset(&username).await;
        self.events
            .emit(
                &username,
                ProgressEvent::phase(Phase::Pending, format!("Spawning {}", image.display_name)),
            )
            .await;
        let stream = self
            .events
            .subscribe(&username)
            .await
            .ok_or_else(|| SpawnError::Internal(anyhow::anyhow!("event stream vanished")))?;

        let controller = Arc::clone(&self.controller);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = controller.drive_spawn(&identity, &image, &spec, &cancel).await {
                // Already reported through events and metrics
                warn!(user = %identity.username, error = %e, "Spawn did not reach Running");
            }
        });

        Ok(stream)
    }

    /// Stop a user's lab
    ///
    /// Cancels an in-flight spawn first, then waits its turn on the
    /// user lock, so a stop issued mid-spawn supersedes the spawn
    /// instead of racing it. Idempotent: stopping a user with no
    /// session is a no-op.
    pub async fn stop(&self, username: &str, reason: StopReason) -> Result<(), SpawnError> {
        if self.registry.get(username).await.is_none() {
            return Ok(());
        }
        self.controller.cancel_spawn(username);
        let _guard = self.registry.lock_user(username).await;
        if self.registry.get(username).await.is_none() {
            return Ok(());
        }
        self.controller.stop(username, reason).await
    }

    /// Current phase of a user's session, if one exists
    pub async fn status(&self, username: &str) -> Option<Phase> {
        self.registry.get(username).await.map(|s| s.phase)
    }

    /// Subscribe to a session's progress events (history replays first)
    pub async fn subscribe(&self, username: &str) -> Option<EventStream> {
        self.events.subscribe(username).await
    }

    /// Record user activity, deferring the idle cull
    pub async fn touch(&self, username: &str) {
        self.registry.update(username, SessionState::touch).await;
    }

    /// Stop every Running session idle past the configured timeout
    pub async fn cull_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout()).unwrap_or_default();
        let idle: Vec<String> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter(|s| s.phase == Phase::Running && s.last_activity_at < cutoff)
            .map(|s| s.identity.username)
            .collect();

        let mut culled = 0;
        for username in idle {
            match self.stop(&username, StopReason::IdleCulled).await {
                Ok(()) => culled += 1,
                Err(e) => {
                    warn!(user = %username, error = %e, "Idle cull failed");
                }
            }
        }
        culled
    }

    /// Load persisted session records after a restart
    ///
    /// Terminal records are dropped; the rest are re-registered for
    /// [`Spawner::reconcile_all`] to verify against the cluster.
    pub async fn restore_sessions(&self, sessions: Vec<SessionState>) -> usize {
        let mut restored = 0;
        for session in sessions {
            if session.is_terminal() {
                continue;
            }
            let username = session.identity.username.clone();
            if let Err(e) = self.registry.insert(session).await {
                warn!(user = %username, error = %e, "Could not restore session");
            } else {
                restored += 1;
            }
        }
        metrics::ACTIVE_SESSIONS.set(self.registry.len().await as i64);
        restored
    }

    /// Export session records for persistence
    pub async fn export_sessions(&self) -> Vec<SessionState> {
        self.registry.all().await
    }

    /// Re-derive every non-terminal session from the cluster
    ///
    /// Sessions whose workload still exists re-attach; sessions whose
    /// workload is gone fail with `WorkloadVanished`. Nothing is ever
    /// re-submitted from here.
    pub async fn reconcile_all(&self) -> Vec<(String, Result<Phase, SpawnError>)> {
        let mut results = Vec::new();
        for username in self.registry.usernames().await {
            let _guard = self.registry.lock_user(&username).await;
            let result = self.controller.reconcile(&username).await;
            results.push((username, result));
        }
        results
    }
}
