//! Lifecycle controller
//!
//! The per-user state machine: submit, poll to Running, stop, delete,
//! reconcile after restart. This is the only module that mutates cluster
//! state or session records; callers hold the registry's per-user lock
//! for the duration of any operation here.
//!
//! Transient cluster errors are retried with capped exponential backoff
//! inside the controller; fatal errors (denied, quota) terminate the
//! attempt immediately. Cancellation is cooperative: a stop during
//! Pending/Starting flips the spawn's token, which the poll loop checks
//! between iterations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::{self, WorkloadSpec};
use crate::catalog::ImageReference;
use crate::cluster::{observe, ClusterApi, ClusterError, PodPhase};
use crate::config::SpawnerConfig;
use crate::error::SpawnError;
use crate::events::{EventReporter, ProgressEvent};
use crate::identity::UserIdentity;
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::session::{Phase, StopReason};

/// How a spawn's poll loop ended
#[derive(Debug, PartialEq, Eq)]
enum SpawnOutcome {
    Running,
    /// A stop request cancelled the spawn; the stop path owns cleanup
    Cancelled,
}

pub struct LifecycleController {
    config: SpawnerConfig,
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<SessionRegistry>,
    events: Arc<EventReporter>,
    /// Cancellation tokens for in-flight spawns, keyed by username
    cancels: StdMutex<HashMap<String, CancellationToken>>,
}

impl LifecycleController {
    pub fn new(
        config: SpawnerConfig,
        cluster: Arc<dyn ClusterApi>,
        registry: Arc<SessionRegistry>,
        events: Arc<EventReporter>,
    ) -> Self {
        Self {
            config,
            cluster,
            registry,
            events,
            cancels: StdMutex::new(HashMap::new()),
        }
    }

    /// Register the cancellation token for an accepted spawn
    pub fn register_cancel(&self, username: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel map poisoned")
            .insert(username.to_string(), token.clone());
        token
    }

    /// Cancel an in-flight spawn, if any. Returns whether one was found.
    pub fn cancel_spawn(&self, username: &str) -> bool {
        self.cancels
            .lock()
            .expect("cancel map poisoned")
            .get(username)
            .map(CancellationToken::cancel)
            .is_some()
    }

    pub(crate) fn clear_cancel(&self, username: &str) {
        self.cancels
            .lock()
            .expect("cancel map poisoned")
            .remove(username);
    }

    /// Drive an accepted spawn to Running (or a terminal failure)
    ///
    /// The session record already exists in Pending; the caller holds
    /// the user lock. On failure the record moves to Failed and the
    /// partially created pod is rolled back (PVCs are kept, they carry
    /// user data).
    pub async fn drive_spawn(
        &self,
        identity: &UserIdentity,
        image: &ImageReference,
        spec: &WorkloadSpec,
        cancel: &CancellationToken,
    ) -> Result<(), SpawnError> {
        let username = &identity.username;
        let started = Instant::now();

        let result = self.submit_and_poll(username, spec, cancel).await;
        self.clear_cancel(username);

        match result {
            Ok(SpawnOutcome::Running) => {
                metrics::SPAWN_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
                info!(
                    user = %username,
                    pod = %spec.pod_name(),
                    image = %image.reference,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Lab is running"
                );
                Ok(())
            }
            Ok(SpawnOutcome::Cancelled) => {
                info!(user = %username, "Spawn cancelled by stop request");
                Ok(())
            }
            Err(e) => {
                self.fail_session(username, &e).await;
                Err(e)
            }
        }
    }

    async fn submit_and_poll(
        &self,
        username: &str,
        spec: &WorkloadSpec,
        cancel: &CancellationToken,
    ) -> Result<SpawnOutcome, SpawnError> {
        if cancel.is_cancelled() {
            return Ok(SpawnOutcome::Cancelled);
        }

        // The registry already enforces one spawn per user; a live pod
        // here means a retried submit or a crash-restart race.
        let selector = builder::label_selector_for(username);
        let existing = self.retry_transient(cancel, || self.cluster.list_pods(&selector)).await?;
        if let Some(outcome) = existing {
            if !outcome.is_empty() {
                return Err(SpawnError::SubmitConflict(username.to_string()));
            }
        } else {
            return Ok(SpawnOutcome::Cancelled);
        }

        let submitted = self
            .retry_transient(cancel, || async {
                match crate::cluster::submit_workload(self.cluster.as_ref(), spec).await {
                    Ok(()) => Ok(true),
                    // Lost the race against a leftover pod with our name
                    Err(ClusterError::AlreadyExists) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;
        match submitted {
            None => return Ok(SpawnOutcome::Cancelled),
            Some(false) => return Err(SpawnError::SubmitConflict(username.to_string())),
            Some(true) => {}
        }

        self.events
            .emit(username, ProgressEvent::phase(Phase::Pending, "Lab pod submitted"))
            .await;

        self.poll_until_running(username, spec.pod_name(), cancel).await
    }

    /// Poll the pod with backoff until it reaches Running
    async fn poll_until_running(
        &self,
        username: &str,
        pod_name: &str,
        cancel: &CancellationToken,
    ) -> Result<SpawnOutcome, SpawnError> {
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.start_deadline();
        let mut pull_backoff_since: Option<Instant> = None;
        let mut transient_failures: u32 = 0;
        let mut round: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(SpawnOutcome::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(SpawnError::StartDeadlineExceeded(
                    timeouts.start_deadline_secs,
                ));
            }

            match timeout(timeouts.call_timeout(), self.cluster.get_pod(pod_name)).await {
                Err(_) => {
                    transient_failures += 1;
                    if transient_failures > timeouts.retry_attempts {
                        return Err(SpawnError::RetriesExhausted {
                            attempts: transient_failures,
                            message: "status poll timed out".to_string(),
                        });
                    }
                }
                Ok(Err(e)) => {
                    if let Some(fatal) = fatal_error(&e) {
                        return Err(fatal);
                    }
                    transient_failures += 1;
                    if transient_failures > timeouts.retry_attempts {
                        return Err(SpawnError::RetriesExhausted {
                            attempts: transient_failures,
                            message: e.to_string(),
                        });
                    }
                }
                Ok(Ok(None)) => {
                    return Err(SpawnError::WorkloadVanished(format!(
                        "pod {pod_name} disappeared before reaching Running"
                    )));
                }
                Ok(Ok(Some(pod))) => {
                    transient_failures = 0;
                    let obs = observe(&pod);
                    match obs.phase {
                        PodPhase::Running => {
                            self.registry
                                .update(username, |s| {
                                    s.transition(Phase::Running);
                                    s.pod_ip.clone_from(&obs.pod_ip);
                                    s.pod_uid.clone_from(&obs.pod_uid);
                                })
                                .await;
                            self.events
                                .emit(username, ProgressEvent::phase(Phase::Running, "Lab is ready"))
                                .await;
                            return Ok(SpawnOutcome::Running);
                        }
                        PodPhase::Starting => {
                            self.note_starting(username, &obs.pod_uid).await;
                            match obs.waiting_reason.as_deref() {
                                Some("ImagePullBackOff" | "ErrImagePull") => {
                                    let since =
                                        *pull_backoff_since.get_or_insert_with(Instant::now);
                                    if since.elapsed() >= timeouts.pull_timeout() {
                                        return Err(SpawnError::ImagePullTimeout(format!(
                                            "pod {pod_name} stuck pulling its image"
                                        )));
                                    }
                                }
                                _ => pull_backoff_since = None,
                            }
                        }
                        PodPhase::Succeeded | PodPhase::Failed => {
                            return Err(SpawnError::WorkloadVanished(format!(
                                "pod {pod_name} terminated before reaching Running"
                            )));
                        }
                        PodPhase::Pending | PodPhase::Unknown => {}
                    }
                }
            }

            round += 1;
            let delay = backoff_delay(round, timeouts.poll_base(), timeouts.poll_cap());
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Record the Pending -> Starting transition, emitting it only once
    async fn note_starting(&self, username: &str, pod_uid: &Option<String>) {
        let mut transitioned = false;
        self.registry
            .update(username, |s| {
                if s.phase == Phase::Pending {
                    s.transition(Phase::Starting);
                    transitioned = true;
                }
                if s.pod_uid.is_none() {
                    s.pod_uid.clone_from(pod_uid);
                }
            })
            .await;
        if transitioned {
            self.events
                .emit(
                    username,
                    ProgressEvent::phase(Phase::Starting, "Lab container starting"),
                )
                .await;
        }
    }

    /// Stop a session: graceful delete, poll until gone, remove record
    ///
    /// Valid from any phase, including Failed. The caller holds the user
    /// lock and has already cancelled any in-flight spawn.
    pub async fn stop(&self, username: &str, reason: StopReason) -> Result<(), SpawnError> {
        let Some(session) = self.registry.get(username).await else {
            return Ok(());
        };
        let pod_name = session.pod_name.clone();

        self.registry
            .update(username, |s| s.transition(Phase::Stopping))
            .await;
        self.events
            .emit(
                username,
                ProgressEvent::stopping(Phase::Stopping, reason, "Shutting down lab"),
            )
            .await;
        metrics::STOPS_TOTAL.with_label_values(&[reason.as_str()]).inc();

        // Config maps go first; losing them is harmless if the pod
        // delete then fails and is retried.
        for config_map in [format!("lab-{}-env", builder::sanitize(username))] {
            if let Err(e) = self.cluster.delete_config_map(&config_map).await {
                warn!(user = %username, config_map = %config_map, error = %e, "ConfigMap delete failed");
            }
        }

        self.delete_pod_with_retry(&pod_name).await?;
        self.poll_until_gone(&pod_name).await?;

        self.registry
            .update(username, |s| s.transition(Phase::Stopped))
            .await;
        self.events
            .emit(
                username,
                ProgressEvent::stopping(Phase::Stopped, reason, "Lab stopped"),
            )
            .await;

        self.registry.remove(username).await;
        self.events.remove(username).await;
        metrics::ACTIVE_SESSIONS.set(self.registry.len().await as i64);
        info!(user = %username, pod = %pod_name, reason = reason.as_str(), "Session removed");
        Ok(())
    }

    async fn delete_pod_with_retry(&self, pod_name: &str) -> Result<(), SpawnError> {
        let timeouts = &self.config.timeouts;
        let mut attempts: u32 = 0;
        loop {
            match timeout(timeouts.call_timeout(), self.cluster.delete_pod(pod_name)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(ClusterError::NotFound)) => return Ok(()),
                Ok(Err(e)) => {
                    if let Some(fatal) = fatal_error(&e) {
                        return Err(fatal);
                    }
                    attempts += 1;
                    if attempts > timeouts.retry_attempts {
                        return Err(SpawnError::RetriesExhausted {
                            attempts,
                            message: e.to_string(),
                        });
                    }
                }
                Err(_) => {
                    attempts += 1;
                    if attempts > timeouts.retry_attempts {
                        return Err(SpawnError::RetriesExhausted {
                            attempts,
                            message: format!("delete of pod {pod_name} timed out"),
                        });
                    }
                }
            }
            tokio::time::sleep(backoff_delay(attempts, timeouts.poll_base(), timeouts.poll_cap()))
                .await;
        }
    }

    /// Wait until the pod is actually gone, not merely marked for deletion
    async fn poll_until_gone(&self, pod_name: &str) -> Result<(), SpawnError> {
        let timeouts = &self.config.timeouts;
        let deadline = Instant::now() + timeouts.stop_deadline();
        let mut round: u32 = 0;
        loop {
            match timeout(timeouts.call_timeout(), self.cluster.get_pod(pod_name)).await {
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(_))) | Ok(Err(_)) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(SpawnError::RetriesExhausted {
                    attempts: round,
                    message: format!("pod {pod_name} still present at the stop deadline"),
                });
            }
            round += 1;
            tokio::time::sleep(backoff_delay(round, timeouts.poll_base(), timeouts.poll_cap()))
                .await;
        }
    }

    /// Re-derive a session's state from the cluster after a restart
    ///
    /// The cluster is the source of truth: the workload is rediscovered
    /// by its label set, never through the cached handle. A missing
    /// workload fails the session rather than re-submitting it, so a
    /// crash can never cause a duplicate spawn.
    pub async fn reconcile(&self, username: &str) -> Result<Phase, SpawnError> {
        let Some(session) = self.registry.get(username).await else {
            return Err(SpawnError::WorkloadVanished(format!(
                "no session record for {username}"
            )));
        };
        if session.is_terminal() {
            return Ok(session.phase);
        }

        let selector = builder::label_selector_for(username);
        let timeouts = &self.config.timeouts;
        let pods = match timeout(timeouts.call_timeout(), self.cluster.list_pods(&selector)).await {
            Ok(Ok(pods)) => pods,
            Ok(Err(e)) => {
                if let Some(fatal) = fatal_error(&e) {
                    return Err(fatal);
                }
                return Err(SpawnError::RetriesExhausted {
                    attempts: 1,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SpawnError::RetriesExhausted {
                    attempts: 1,
                    message: format!("listing pods for {username} timed out"),
                });
            }
        };

        let live = pods.iter().find(|pod| {
            let obs = observe(pod);
            !matches!(obs.phase, PodPhase::Succeeded | PodPhase::Failed)
        });

        match live {
            Some(pod) => {
                let obs = observe(pod);
                let name = pod.metadata.name.clone().unwrap_or_default();
                let phase = match obs.phase {
                    PodPhase::Running => Phase::Running,
                    PodPhase::Starting => Phase::Starting,
                    _ => Phase::Pending,
                };
                self.registry
                    .update(username, |s| {
                        s.pod_name = name;
                        s.pod_uid.clone_from(&obs.pod_uid);
                        s.pod_ip.clone_from(&obs.pod_ip);
                        s.transition(phase);
                    })
                    .await;
                self.events.ensure(username).await;
                self.events
                    .emit(
                        username,
                        ProgressEvent::phase(phase, "Re-attached to existing lab"),
                    )
                    .await;
                info!(user = %username, phase = %phase, "Reconciled session from cluster");
                Ok(phase)
            }
            None => {
                let err = SpawnError::WorkloadVanished(format!(
                    "no workload found for {username} during reconciliation"
                ));
                self.fail_session(username, &err).await;
                Err(err)
            }
        }
    }

    /// Mark a session Failed and roll back the partially created pod
    async fn fail_session(&self, username: &str, err: &SpawnError) {
        warn!(user = %username, reason = err.reason(), error = %err, "Spawn failed");
        metrics::SPAWN_FAILURES.with_label_values(&[err.reason()]).inc();

        // Best-effort rollback; PVCs are kept, they carry user data.
        let pod_name = builder::pod_name_for(username);
        if let Err(delete_err) = self.cluster.delete_pod(&pod_name).await {
            if !matches!(delete_err, ClusterError::NotFound) {
                warn!(user = %username, pod = %pod_name, error = %delete_err, "Rollback delete failed");
            }
        }

        let message = err.to_string();
        self.registry
            .update(username, |s| {
                s.transition(Phase::Failed);
                s.last_error = Some(message.clone());
            })
            .await;
        self.events
            .emit(username, ProgressEvent::failed(err.reason(), message))
            .await;
    }

    /// Retry a transient-failure-prone call with backoff
    ///
    /// Returns `Ok(None)` when cancelled between attempts.
    async fn retry_transient<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<Option<T>, SpawnError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClusterError>>,
    {
        let timeouts = &self.config.timeouts;
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let outcome = timeout(timeouts.call_timeout(), call()).await;
            let message = match outcome {
                Ok(Ok(value)) => return Ok(Some(value)),
                Ok(Err(e)) => {
                    if let Some(fatal) = fatal_error(&e) {
                        return Err(fatal);
                    }
                    e.to_string()
                }
                Err(_) => "cluster call timed out".to_string(),
            };
            attempts += 1;
            if attempts > timeouts.retry_attempts {
                return Err(SpawnError::RetriesExhausted { attempts, message });
            }
            let delay = backoff_delay(attempts, timeouts.poll_base(), timeouts.poll_cap());
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Map non-retryable cluster errors onto the user-visible taxonomy
fn fatal_error(err: &ClusterError) -> Option<SpawnError> {
    match err {
        ClusterError::Denied(message) => Some(SpawnError::SpawnDenied(message.clone())),
        ClusterError::QuotaExceeded(message) => Some(SpawnError::QuotaExceeded(message.clone())),
        _ => None,
    }
}

/// Capped exponential backoff with jitter
fn backoff_delay(round: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(round.min(16)));
    let capped = exp.min(cap);
    // Up to 25% jitter so synchronized pollers spread out
    let jitter = capped.mul_f64(rand::random::<f64>() * 0.25);
    capped + jitter
}
