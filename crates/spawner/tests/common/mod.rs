//! Common test utilities
#![allow(dead_code)] // Helpers may not be used in all test files

use std::collections::{HashMap, VecDeque};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateWaiting, ContainerStatus, PersistentVolumeClaim, Pod,
    PodStatus,
};

use labpod_spawner::catalog::CatalogSnapshot;
use labpod_spawner::cluster::{ClusterApi, ClusterError};
use labpod_spawner::{ImageClass, ImageReference, SpawnerConfig, UserIdentity};

/// In-memory cluster with scriptable pod status progressions
///
/// Each `get_pod` call advances the pod through its scripted status
/// queue; the last status is sticky. Creates can be primed to fail.
#[derive(Default)]
pub struct MockCluster {
    inner: Mutex<Inner>,
    create_pod_calls: AtomicU32,
    hang_list_pods: AtomicBool,
}

#[derive(Default)]
struct Inner {
    pods: HashMap<String, Pod>,
    pvcs: HashMap<String, PersistentVolumeClaim>,
    config_maps: HashMap<String, ConfigMap>,
    status_scripts: HashMap<String, VecDeque<PodStatus>>,
    create_pod_errors: VecDeque<ClusterError>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Prime the status sequence `get_pod` walks through for one pod
    pub fn script_statuses(&self, pod_name: &str, statuses: Vec<PodStatus>) {
        self.inner
            .lock()
            .unwrap()
            .status_scripts
            .insert(pod_name.to_string(), statuses.into());
    }

    /// Make the next `create_pod` calls fail with the given errors
    pub fn fail_next_creates(&self, errors: Vec<ClusterError>) {
        self.inner.lock().unwrap().create_pod_errors.extend(errors);
    }

    /// Place a pod directly, bypassing `create_pod` (restart scenarios)
    pub fn insert_pod(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.inner.lock().unwrap().pods.insert(name, pod);
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.inner.lock().unwrap().pods.contains_key(name)
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.inner.lock().unwrap().pods.get(name).cloned()
    }

    pub fn has_config_map(&self, name: &str) -> bool {
        self.inner.lock().unwrap().config_maps.contains_key(name)
    }

    pub fn create_pod_calls(&self) -> u32 {
        self.create_pod_calls.load(Ordering::SeqCst)
    }

    /// Make `list_pods` hang forever, simulating a wedged apiserver
    pub fn hang_list_pods(&self) {
        self.hang_list_pods.store(true, Ordering::SeqCst);
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let empty = std::collections::BTreeMap::new();
    let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
    selector.split(',').all(|pair| match pair.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|have| have == value),
        None => false,
    })
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.create_pod_errors.pop_front() {
            return Err(err);
        }
        let name = pod.metadata.name.clone().unwrap_or_default();
        if inner.pods.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        inner.pods.insert(name, pod.clone());
        self.create_pod_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let name = pvc.metadata.name.clone().unwrap_or_default();
        if inner.pvcs.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        inner.pvcs.insert(name, pvc.clone());
        Ok(())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<(), ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let name = config_map.metadata.name.clone().unwrap_or_default();
        if inner.config_maps.contains_key(&name) {
            return Err(ClusterError::AlreadyExists);
        }
        inner.config_maps.insert(name, config_map.clone());
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ClusterError> {
        let mut inner = self.inner.lock().unwrap();
        let next_status = inner.status_scripts.get_mut(name).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        let Some(pod) = inner.pods.get_mut(name) else {
            return Ok(None);
        };
        if let Some(status) = next_status {
            pod.status = Some(status);
        }
        Ok(Some(pod.clone()))
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>, ClusterError> {
        if self.hang_list_pods.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .pods
            .values()
            .filter(|pod| matches_selector(pod, selector))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        self.inner.lock().unwrap().pods.remove(name);
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<(), ClusterError> {
        self.inner.lock().unwrap().config_maps.remove(name);
        Ok(())
    }
}

/// Pod status builders mirroring what the kubelet reports

pub fn pending_status() -> PodStatus {
    PodStatus {
        phase: Some("Pending".to_string()),
        ..Default::default()
    }
}

pub fn starting_status(waiting_reason: &str) -> PodStatus {
    PodStatus {
        phase: Some("Pending".to_string()),
        container_statuses: Some(vec![ContainerStatus {
            name: "lab".to_string(),
            state: Some(ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(waiting_reason.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn running_status(pod_ip: &str) -> PodStatus {
    PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some(pod_ip.to_string()),
        ..Default::default()
    }
}

/// Config with millisecond-scale polling so tests finish quickly
pub fn fast_config() -> SpawnerConfig {
    let mut config = SpawnerConfig::default();
    config.timeouts.poll_base_ms = 5;
    config.timeouts.poll_cap_ms = 20;
    config.timeouts.retry_attempts = 2;
    config.timeouts.start_deadline_secs = 30;
    config.timeouts.stop_deadline_secs = 10;
    config
}

pub fn identity(username: &str) -> UserIdentity {
    UserIdentity::new(username, 1000)
}

pub fn weekly_image() -> ImageReference {
    ImageReference {
        reference: "registry.example.com/lab:w_2024_10".to_string(),
        tag: "w_2024_10".to_string(),
        digest: String::new(),
        display_name: "Weekly 10".to_string(),
        class: ImageClass::Weekly,
        recommended: false,
    }
}

pub fn release_image() -> ImageReference {
    ImageReference {
        reference: "registry.example.com/lab:r_2024_1".to_string(),
        tag: "r_2024_1".to_string(),
        digest: "sha256:419c".to_string(),
        display_name: "Release 2024.1".to_string(),
        class: ImageClass::Release,
        recommended: true,
    }
}

pub fn snapshot() -> CatalogSnapshot {
    CatalogSnapshot::new(vec![release_image(), weekly_image()], vec![])
}
