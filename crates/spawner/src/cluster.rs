//! Cluster API seam
//!
//! All cluster-mutating calls go through the [`ClusterApi`] trait so the
//! lifecycle controller can be driven against a mock in tests. The
//! production implementation wraps kube `Api` handles scoped to the
//! deployment namespace.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client,
};
use thiserror::Error;

use crate::builder::WorkloadSpec;

/// Classified cluster API failure
///
/// The lifecycle controller decides retry behavior purely from this
/// classification: `Transient` is retried with backoff, everything else
/// terminates the attempt immediately.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error("request denied: {0}")]
    Denied(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transient cluster error: {0}")]
    Transient(String),
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) => match response.code {
                404 => Self::NotFound,
                409 => Self::AlreadyExists,
                401 | 403 => {
                    if response.message.contains("exceeded quota") {
                        Self::QuotaExceeded(response.message.clone())
                    } else {
                        Self::Denied(response.message.clone())
                    }
                }
                _ => Self::Transient(err.to_string()),
            },
            _ => Self::Transient(err.to_string()),
        }
    }
}

/// What one status poll observed about a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub phase: PodPhase,
    pub pod_ip: Option<String>,
    pub pod_uid: Option<String>,
    /// Waiting reason of the first non-running container, e.g.
    /// "ImagePullBackOff"
    pub waiting_reason: Option<String>,
}

/// Pod phase as the controller sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not yet scheduled / no containers created
    Pending,
    /// Scheduled, containers being created or pulled
    Starting,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Derive an observation from a raw pod object
pub fn observe(pod: &Pod) -> PodObservation {
    let status = pod.status.as_ref();
    let waiting_reason = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses
                .iter()
                .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
                .next()
        });

    let phase = status.and_then(|s| s.phase.as_deref()).map_or(
        PodPhase::Unknown,
        |phase| match phase {
            "Pending" => {
                // Containers present means the pod is scheduled and the
                // kubelet is working on it.
                let has_containers = status
                    .and_then(|s| s.container_statuses.as_ref())
                    .is_some_and(|cs| !cs.is_empty());
                if has_containers {
                    PodPhase::Starting
                } else {
                    PodPhase::Pending
                }
            }
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        },
    );

    PodObservation {
        phase,
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        pod_uid: pod.metadata.uid.clone(),
        waiting_reason,
    }
}

/// The cluster operations the lifecycle controller needs
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError>;
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError>;
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError>;
    /// Discover pods by label selector, e.g. "app=labpod,labpod.io/user=alice"
    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;
    async fn delete_config_map(&self, name: &str) -> Result<(), ClusterError>;
}

/// Submit every object of a workload: ConfigMaps, then PVCs, then the pod
///
/// PVCs carry user data and are reused across spawns, so AlreadyExists
/// is not an error for them (nor for ConfigMaps, which are overwritten
/// content-identically on a re-spawn of the same triple).
pub async fn submit_workload(
    cluster: &dyn ClusterApi,
    spec: &WorkloadSpec,
) -> Result<(), ClusterError> {
    for config_map in &spec.config_maps {
        match cluster.create_config_map(config_map).await {
            Ok(()) | Err(ClusterError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
    }
    for pvc in &spec.pvcs {
        match cluster.create_pvc(pvc).await {
            Ok(()) | Err(ClusterError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
    }
    cluster.create_pod(&spec.pod).await
}

/// Production implementation backed by the kube client
pub struct KubeCluster {
    pods: Api<Pod>,
    pvcs: Api<PersistentVolumeClaim>,
    config_maps: Api<ConfigMap>,
}

impl KubeCluster {
    /// Connect using the default client (in-cluster or kubeconfig)
    pub async fn connect(namespace: &str) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            pvcs: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        self.pods.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        self.pvcs.create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError> {
        self.config_maps
            .create(&PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pods.get_opt(name).await?)
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().labels(selector);
        Ok(self.pods.list(&params).await?.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match ClusterError::from(e) {
                // Already gone is what a delete wants
                ClusterError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn delete_config_map(&self, name: &str) -> Result<(), ClusterError> {
        match self.config_maps.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match ClusterError::from(e) {
                ClusterError::NotFound => Ok(()),
                other => Err(other),
            },
        }
    }
}
