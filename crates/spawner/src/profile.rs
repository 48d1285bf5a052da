//! Declarative spawn profile
//!
//! What the user (or policy) asked the lab environment to look like:
//! resource sizing, volumes, init containers, environment overlay, and
//! node placement. Compared structurally for idempotence checks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::LabSize;
use crate::error::SpawnError;

/// Resource sizing: either a named preset or explicit quantities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sizing {
    /// A named size from the configured presets, e.g. "medium"
    Preset(String),
    /// Explicit limits; requests default to a fraction of limits
    Explicit { cpu: String, memory: String },
}

impl Default for Sizing {
    fn default() -> Self {
        Self::Preset("small".to_string())
    }
}

/// A volume the lab mounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name; also names the generated PVC when no claim is given
    pub name: String,
    /// Existing PVC to bind; `None` means the builder creates one
    #[serde(default)]
    pub claim_name: Option<String>,
    /// Mount path inside the lab container
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// An init container run before the lab container, in declared order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Declarative description of one user's lab environment
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpawnProfile {
    #[serde(default)]
    pub sizing: Sizing,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub init_containers: Vec<InitContainerSpec>,
    /// Environment overlay; wins over the base environment on conflict
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    /// Ask the lab to emit debug logs (DEBUG env)
    #[serde(default)]
    pub enable_debug: bool,
    /// Clear the user's .local directory on startup (CLEAR_DOTLOCAL env)
    #[serde(default)]
    pub clear_dotlocal: bool,
}

/// Concrete cpu/memory quantities after sizing resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResources {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub cpu_request: String,
    pub memory_request: String,
}

impl SpawnProfile {
    /// Validate the profile against the configured size presets
    ///
    /// Rejects non-positive resource quantities, malformed object names,
    /// and duplicate mount paths. Total for well-formed inputs.
    pub fn validate(&self, sizes: &std::collections::HashMap<String, LabSize>) -> Result<(), SpawnError> {
        self.resolve_resources(sizes)?;

        let mut seen_paths = std::collections::HashSet::new();
        for volume in &self.volumes {
            validate_object_name(&volume.name)?;
            if let Some(claim) = &volume.claim_name {
                validate_object_name(claim)?;
            }
            if volume.mount_path.is_empty() || !volume.mount_path.starts_with('/') {
                return Err(SpawnError::InvalidProfile(format!(
                    "mount path '{}' must be absolute",
                    volume.mount_path
                )));
            }
            if !seen_paths.insert(volume.mount_path.as_str()) {
                return Err(SpawnError::InvalidProfile(format!(
                    "duplicate mount path '{}'",
                    volume.mount_path
                )));
            }
        }

        for init in &self.init_containers {
            validate_object_name(&init.name)?;
        }

        Ok(())
    }

    /// Resolve sizing into concrete quantities
    ///
    /// Requests default to 25% of limits, matching the deployed policy
    /// of overcommitting idle labs.
    pub fn resolve_resources(
        &self,
        sizes: &std::collections::HashMap<String, LabSize>,
    ) -> Result<ResolvedResources, SpawnError> {
        let (cpu, memory) = match &self.sizing {
            Sizing::Preset(name) => {
                let size = sizes.get(name).ok_or_else(|| {
                    SpawnError::InvalidProfile(format!("unknown size preset '{name}'"))
                })?;
                (size.cpu.clone(), size.ram.clone())
            }
            Sizing::Explicit { cpu, memory } => (cpu.clone(), memory.clone()),
        };

        let cpu_value = parse_quantity(&cpu)
            .ok_or_else(|| SpawnError::InvalidProfile(format!("bad cpu quantity '{cpu}'")))?;
        let memory_value = parse_quantity(&memory)
            .ok_or_else(|| SpawnError::InvalidProfile(format!("bad memory quantity '{memory}'")))?;
        if cpu_value <= 0.0 || memory_value <= 0.0 {
            return Err(SpawnError::InvalidProfile(
                "resource limits must be positive".to_string(),
            ));
        }

        Ok(ResolvedResources {
            cpu_request: scale_quantity(&cpu, 0.25),
            memory_request: scale_quantity(&memory, 0.25),
            cpu_limit: cpu,
            memory_limit: memory,
        })
    }
}

/// Parse a Kubernetes-style quantity ("2", "500m", "3G", "512Mi") into a
/// unitless magnitude, for sign/shape validation only.
fn parse_quantity(quantity: &str) -> Option<f64> {
    let trimmed = quantity.trim();
    if trimmed.is_empty() {
        return None;
    }
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(digits_end);
    let value: f64 = number.parse().ok()?;
    match suffix {
        "" | "m" | "k" | "K" | "M" | "G" | "T" | "Ki" | "Mi" | "Gi" | "Ti" => Some(value),
        _ => None,
    }
}

/// Scale a quantity preserving its unit suffix, e.g. ("2", 0.25) -> "500m"
/// and ("4G", 0.25) -> "1G".
fn scale_quantity(quantity: &str, factor: f64) -> String {
    let digits_end = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(digits_end);
    let Ok(value) = number.parse::<f64>() else {
        return quantity.to_string();
    };
    let scaled = value * factor;
    // Whole cpus that scale to a fraction switch to millicores
    if suffix.is_empty() && scaled.fract() != 0.0 {
        return format!("{}m", (scaled * 1000.0).round() as u64);
    }
    if scaled.fract() == 0.0 {
        format!("{}{suffix}", scaled as u64)
    } else {
        format!("{scaled}{suffix}")
    }
}

/// RFC 1123 label check for object and volume names
pub(crate) fn validate_object_name(name: &str) -> Result<(), SpawnError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(SpawnError::InvalidProfile(format!(
            "'{name}' is not a valid object name"
        )))
    }
}
