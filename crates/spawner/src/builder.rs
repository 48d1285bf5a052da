//! Workload spec builder
//!
//! Renders the cluster-ready manifests (Pod + PVCs + env ConfigMap) for
//! one user's lab. Pure: the same (identity, image, profile) triple
//! always produces a structurally identical `WorkloadSpec`, and object
//! names derive deterministically from the username so repeated builds
//! overwrite rather than proliferate.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use crate::catalog::ImageReference;
use crate::config::SpawnerConfig;
use crate::error::SpawnError;
use crate::identity::UserIdentity;
use crate::profile::{ResolvedResources, SpawnProfile};

/// Label present on every object this core creates
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "labpod";
/// Label carrying the owning username; discovery key for reconciliation
pub const USER_LABEL: &str = "labpod.io/user";
/// Annotation carrying the raw (unsanitized) username
pub const SESSION_ANNOTATION: &str = "labpod.io/session";

const LAB_CONTAINER: &str = "lab";
const NOTEBOOK_PORT: i32 = 8888;

/// Fully rendered cluster manifests for one user's lab
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub pod: Pod,
    pub pvcs: Vec<PersistentVolumeClaim>,
    pub config_maps: Vec<ConfigMap>,
}

impl WorkloadSpec {
    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Deterministic pod name for a user
pub fn pod_name_for(username: &str) -> String {
    format!("lab-{}", sanitize(username))
}

/// Label selector that rediscovers a user's workload by identity alone
pub fn label_selector_for(username: &str) -> String {
    format!("{APP_LABEL}={APP_LABEL_VALUE},{USER_LABEL}={}", sanitize(username))
}

/// Map a hub username onto a DNS-1123 label fragment, injectively
///
/// Usernames that are already safe (lowercase alphanumeric, at most 32
/// characters) pass through unchanged. Any other username is folded for
/// readability and suffixed with a stable hash tag of the raw name, so
/// two distinct users can never share a pod name, PVC name, or
/// discovery label. Folded forms always contain a '-', safe forms never
/// do, which keeps the two ranges disjoint.
pub fn sanitize(username: &str) -> String {
    let safe = !username.is_empty()
        && username.len() <= 32
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if safe {
        return username.to_string();
    }

    let mut folded: String = username
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    folded.truncate(24);
    let folded = folded.trim_matches('-');
    let tag = name_tag(username);
    if folded.is_empty() {
        format!("u-{tag}")
    } else {
        format!("{folded}-{tag}")
    }
}

/// Six hex characters of FNV-1a over the raw username
///
/// FNV rather than the std hasher: the tag is baked into cluster object
/// names, so it must be stable across processes and compiler releases.
fn name_tag(username: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in username.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("{:06x}", hash & 0x00ff_ffff)
}

/// Build the complete workload for (identity, image, profile)
pub fn build(
    identity: &UserIdentity,
    image: &ImageReference,
    profile: &SpawnProfile,
    config: &SpawnerConfig,
) -> Result<WorkloadSpec, SpawnError> {
    profile.validate(&config.sizes)?;
    let resources = profile.resolve_resources(&config.sizes)?;

    if identity.username.is_empty() {
        return Err(SpawnError::InvalidProfile(
            "username must not be empty".to_string(),
        ));
    }
    let user = sanitize(&identity.username);

    let labels = object_labels(&user, config);
    let annotations = object_annotations(identity);

    let env_map = merged_environment(identity, image, profile);
    let env_config_map_name = format!("lab-{user}-env");
    let config_maps = vec![ConfigMap {
        metadata: metadata(&env_config_map_name, config, &labels, &annotations),
        data: Some(env_map.clone()),
        ..Default::default()
    }];

    // PVCs only for volumes that do not name an existing claim
    let mut pvcs = Vec::new();
    let mut pod_volumes = Vec::new();
    let mut mounts = Vec::new();
    for volume in &profile.volumes {
        let claim_name = volume.claim_name.clone().unwrap_or_else(|| {
            let generated = format!("lab-{user}-{}", volume.name);
            pvcs.push(pvc(&generated, config, &labels, &annotations));
            generated
        });
        pod_volumes.push(Volume {
            name: volume.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                read_only: Some(volume.read_only),
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            read_only: Some(volume.read_only),
            ..Default::default()
        });
    }

    // Init containers keep declared order; the builder never reorders
    let init_containers: Vec<Container> = profile
        .init_containers
        .iter()
        .map(|init| Container {
            name: init.name.clone(),
            image: Some(init.image.clone()),
            command: if init.command.is_empty() {
                None
            } else {
                Some(init.command.clone())
            },
            env: env_vars(&init.env),
            ..Default::default()
        })
        .collect();

    // The merged environment goes on the container directly and is also
    // published as a ConfigMap so sidecar tooling can read it.
    let container = Container {
        name: LAB_CONTAINER.to_string(),
        image: Some(image.reference.clone()),
        env: env_vars(&env_map),
        resources: Some(build_resources(&resources)),
        ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
            container_port: NOTEBOOK_PORT,
            name: Some("notebook".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        ..Default::default()
    };

    let spec = PodSpec {
        containers: vec![container],
        init_containers: if init_containers.is_empty() {
            None
        } else {
            Some(init_containers)
        },
        volumes: if pod_volumes.is_empty() {
            None
        } else {
            Some(pod_volumes)
        },
        node_selector: if profile.node_selector.is_empty() {
            None
        } else {
            Some(profile.node_selector.clone())
        },
        restart_policy: Some("Never".to_string()),
        ..Default::default()
    };

    let pod = Pod {
        metadata: metadata(&pod_name_for(&identity.username), config, &labels, &annotations),
        spec: Some(spec),
        ..Default::default()
    };

    Ok(WorkloadSpec {
        pod,
        pvcs,
        config_maps,
    })
}

fn object_labels(user: &str, config: &SpawnerConfig) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = config
        .extra_labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string());
    labels.insert(USER_LABEL.to_string(), user.to_string());
    labels
}

fn object_annotations(identity: &UserIdentity) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(SESSION_ANNOTATION.to_string(), identity.username.clone());
    annotations
}

fn metadata(
    name: &str,
    config: &SpawnerConfig,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels.clone()),
        annotations: Some(annotations.clone()),
        ..Default::default()
    }
}

/// Base lab environment merged with the profile overlay (overlay wins)
fn merged_environment(
    identity: &UserIdentity,
    image: &ImageReference,
    profile: &SpawnProfile,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("JUPYTERHUB_USER".to_string(), identity.username.clone());
    env.insert("USER_UID".to_string(), identity.uid.to_string());
    env.insert(
        "EXTERNAL_GROUPS".to_string(),
        identity.external_groups(),
    );
    env.insert("LAB_IMAGE".to_string(), image.reference.clone());
    env.insert(
        "DEBUG".to_string(),
        if profile.enable_debug { "TRUE" } else { "" }.to_string(),
    );
    env.insert(
        "CLEAR_DOTLOCAL".to_string(),
        if profile.clear_dotlocal { "TRUE" } else { "" }.to_string(),
    );
    for (key, value) in &profile.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

fn env_vars(map: &BTreeMap<String, String>) -> Option<Vec<EnvVar>> {
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect(),
    )
}

fn build_resources(resources: &ResolvedResources) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(resources.cpu_request.clone()));
    requests.insert(
        "memory".to_string(),
        Quantity(resources.memory_request.clone()),
    );

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(resources.cpu_limit.clone()));
    limits.insert("memory".to_string(), Quantity(resources.memory_limit.clone()));

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn pvc(
    name: &str,
    config: &SpawnerConfig,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(config.storage_size.clone()));
    PersistentVolumeClaim {
        metadata: metadata(name, config, labels, annotations),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: config.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ImageClass;
    use crate::profile::{InitContainerSpec, Sizing, VolumeSpec};
    use proptest::prelude::*;

    fn test_image() -> ImageReference {
        ImageReference {
            reference: "registry.example.com/lab:r_2024_1".to_string(),
            tag: "r_2024_1".to_string(),
            digest: String::new(),
            display_name: "Release 2024.1".to_string(),
            class: ImageClass::Release,
            recommended: true,
        }
    }

    fn test_profile() -> SpawnProfile {
        SpawnProfile {
            sizing: Sizing::Preset("small".to_string()),
            volumes: vec![VolumeSpec {
                name: "home".to_string(),
                claim_name: None,
                mount_path: "/home/alice".to_string(),
                read_only: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_deterministic_names_for_alice() {
        let identity = UserIdentity::new("alice", 1000);
        let spec = build(
            &identity,
            &test_image(),
            &test_profile(),
            &SpawnerConfig::default(),
        )
        .unwrap();

        assert_eq!(spec.pod_name(), "lab-alice");
        assert_eq!(spec.pvcs[0].metadata.name.as_deref(), Some("lab-alice-home"));
        assert_eq!(
            spec.config_maps[0].metadata.name.as_deref(),
            Some("lab-alice-env")
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let identity = UserIdentity::new("alice", 1000);
        let config = SpawnerConfig::default();
        let a = build(&identity, &test_image(), &test_profile(), &config).unwrap();
        let b = build(&identity, &test_image(), &test_profile(), &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_discovery_labels_present_on_every_object() {
        let identity = UserIdentity::new("alice", 1000);
        let spec = build(
            &identity,
            &test_image(),
            &test_profile(),
            &SpawnerConfig::default(),
        )
        .unwrap();

        for labels in [
            spec.pod.metadata.labels.as_ref().unwrap(),
            spec.pvcs[0].metadata.labels.as_ref().unwrap(),
            spec.config_maps[0].metadata.labels.as_ref().unwrap(),
        ] {
            assert_eq!(labels[APP_LABEL], APP_LABEL_VALUE);
            assert_eq!(labels[USER_LABEL], "alice");
        }
    }

    #[test]
    fn test_profile_env_overlay_wins() {
        let identity = UserIdentity::new("alice", 1000);
        let mut profile = test_profile();
        profile
            .env
            .insert("JUPYTERHUB_USER".to_string(), "spoofed".to_string());
        profile.env.insert("EXTRA".to_string(), "1".to_string());

        let spec = build(
            &identity,
            &test_image(),
            &profile,
            &SpawnerConfig::default(),
        )
        .unwrap();
        let data = spec.config_maps[0].data.as_ref().unwrap();
        assert_eq!(data["JUPYTERHUB_USER"], "spoofed");
        assert_eq!(data["EXTRA"], "1");
        assert_eq!(data["LAB_IMAGE"], "registry.example.com/lab:r_2024_1");
    }

    #[test]
    fn test_init_container_order_preserved() {
        let identity = UserIdentity::new("alice", 1000);
        let mut profile = test_profile();
        for name in ["zz-first", "aa-second", "mm-third"] {
            profile.init_containers.push(InitContainerSpec {
                name: name.to_string(),
                image: "registry.example.com/init:1".to_string(),
                command: vec![],
                env: BTreeMap::new(),
            });
        }

        let spec = build(
            &identity,
            &test_image(),
            &profile,
            &SpawnerConfig::default(),
        )
        .unwrap();
        let inits = spec.pod.spec.as_ref().unwrap().init_containers.as_ref().unwrap();
        let names: Vec<&str> = inits.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["zz-first", "aa-second", "mm-third"]);
    }

    #[test]
    fn test_existing_claim_generates_no_pvc() {
        let identity = UserIdentity::new("alice", 1000);
        let mut profile = test_profile();
        profile.volumes[0].claim_name = Some("shared-data".to_string());

        let spec = build(
            &identity,
            &test_image(),
            &profile,
            &SpawnerConfig::default(),
        )
        .unwrap();
        assert!(spec.pvcs.is_empty());
        let volumes = spec.pod.spec.as_ref().unwrap().volumes.as_ref().unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "shared-data"
        );
    }

    #[test]
    fn test_sanitize_usernames() {
        // Safe names pass through untouched
        assert_eq!(sanitize("alice"), "alice");
        // Lossy names carry the stable tag of the raw username
        assert_eq!(sanitize("Alice.Smith"), "alice-smith-02bb1e");
        assert_eq!(sanitize("user@example.com"), "user-example-com-f3cadb");
        assert_eq!(sanitize("__x__"), "x-170e7f");
        assert_eq!(sanitize("###"), "u-97d540");
    }

    #[test]
    fn test_sanitize_is_collision_free() {
        // Names that fold identically must not share cluster objects
        assert_ne!(sanitize("alice.smith"), sanitize("alice-smith"));
        assert_ne!(pod_name_for("alice.smith"), pod_name_for("alice-smith"));
        assert_ne!(
            label_selector_for("alice.smith"),
            label_selector_for("alice-smith")
        );
        // Case differences are identity differences too
        assert_ne!(sanitize("Alice"), sanitize("alice"));
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(
            label_selector_for("alice"),
            "app=labpod,labpod.io/user=alice"
        );
        assert_eq!(
            label_selector_for("Alice.Smith"),
            "app=labpod,labpod.io/user=alice-smith-02bb1e"
        );
    }

    proptest! {
        #[test]
        fn test_sanitize_always_yields_valid_label(username in ".{1,64}") {
            let out = sanitize(&username);
            prop_assert!(!out.is_empty());
            prop_assert!(out.len() <= 32);
            prop_assert!(!out.starts_with('-'));
            prop_assert!(!out.ends_with('-'));
            prop_assert!(out
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }

        #[test]
        fn test_sanitize_distinct_inputs_distinct_outputs(
            a in ".{1,40}",
            b in ".{1,40}",
        ) {
            if a != b {
                prop_assert_ne!(sanitize(&a), sanitize(&b));
            }
        }
    }
}
