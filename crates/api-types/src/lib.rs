//! Shared API type definitions
//!
//! This crate contains the data model shared between the provisioning core and
//! its callers: resource quantities, node and pod inventory views, workload
//! requests, and the normalized status token reported back to record stores.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Resource triple used for requests, capacity and usage.
///
/// All dimensions are non-negative. A node that does not advertise GPUs is
/// represented with `gpu_units == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceQuantity {
    /// CPU in millicores (1000 = one core)
    pub cpu_milli_cores: u64,
    /// Memory in bytes
    pub memory_bytes: u64,
    /// Whole GPU devices
    pub gpu_units: u64,
}

impl ResourceQuantity {
    pub const ZERO: Self = Self {
        cpu_milli_cores: 0,
        memory_bytes: 0,
        gpu_units: 0,
    };

    pub const fn new(cpu_milli_cores: u64, memory_bytes: u64, gpu_units: u64) -> Self {
        Self {
            cpu_milli_cores,
            memory_bytes,
            gpu_units,
        }
    }

    /// Per-dimension sum, saturating at `u64::MAX`.
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            cpu_milli_cores: self.cpu_milli_cores.saturating_add(other.cpu_milli_cores),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            gpu_units: self.gpu_units.saturating_add(other.gpu_units),
        }
    }

    /// Per-dimension difference, clamped at zero.
    ///
    /// Over-committed nodes (requests above allocatable) report zero headroom.
    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            cpu_milli_cores: self.cpu_milli_cores.saturating_sub(other.cpu_milli_cores),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            gpu_units: self.gpu_units.saturating_sub(other.gpu_units),
        }
    }
}

impl std::iter::Sum for ResourceQuantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl std::fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpu={}m memory={}B gpu={}",
            self.cpu_milli_cores, self.memory_bytes, self.gpu_units
        )
    }
}

/// Point-in-time view of one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub name: String,
    /// First `InternalIP` address reported by the node, if any
    pub internal_address: Option<String>,
    pub allocatable: ResourceQuantity,
}

/// Summed container resource requests of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodFootprint {
    pub node_name: String,
    pub requested: ResourceQuantity,
}

/// Kind of workload a caller can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    /// Interactive notebook session: pod + service + route
    Session,
    /// Distributed training job with a primary and a worker replica group
    TrainingJob,
    /// Model-serving deployment exposed through a node port service
    ServingDeployment,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Session => "session",
            Self::TrainingJob => "training_job",
            Self::ServingDeployment => "serving_deployment",
        };
        f.write_str(name)
    }
}

/// Replica counts. Zero or missing counts fall back to configured defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaCounts {
    #[serde(default)]
    pub primary: Option<u32>,
    #[serde(default)]
    pub worker: Option<u32>,
}

/// Extra volume mount requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Name of an existing persistent volume claim
    pub claim_name: String,
    pub mount_path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Resource quantities as the caller wrote them, e.g. `cpu: "500m"`, `memory: "8Gi"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceStrings {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub gpu: Option<u64>,
}

/// A single workload provisioning request.
///
/// Built by the caller at request time and treated as immutable once
/// admission starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRequest {
    pub kind: WorkloadKind,
    /// Workload name. Sessions derive their object names from `owner` instead.
    pub name: String,
    /// Target namespace; empty means the configured default for the kind
    #[serde(default)]
    pub namespace: String,
    pub owner: String,
    /// Container image; empty falls back to the configured default image
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub resources: ResourceStrings,
    #[serde(default)]
    pub replicas: ReplicaCounts,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Service ports; sessions use the first entry, serving ignores it
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: Option<String>,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
}

/// Coarse lifecycle classification of a [`NormalizedStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Creating,
    Running,
    Ready,
    Unready,
    Failed,
    Deleting,
    Deleted,
    Unknown,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Status token derived from a live object's raw status.
///
/// The token is kept verbatim (e.g. `"Running"`, `"Initializing"`, `"ready"`)
/// because record stores display it as-is. An empty token means the object
/// exists but has not reported any status yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedStatus(String);

impl NormalizedStatus {
    pub const DELETED: &'static str = "Deleted";

    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Status reported for an object that no longer exists.
    pub fn deleted() -> Self {
        Self(Self::DELETED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// Classify the raw token.
    pub fn phase(&self) -> LifecyclePhase {
        match self.0.as_str() {
            "" | "Pending" | "Creating" | "ContainerCreating" | "Initializing" | "Created"
            | "Resetting" => LifecyclePhase::Creating,
            "Running" | "Restarting" => LifecyclePhase::Running,
            "Ready" | "ready" | "Succeeded" | "Completed" => LifecyclePhase::Ready,
            "unready" | "Unready" | "NotReady" => LifecyclePhase::Unready,
            "Failed" | "Error" | "Aborted" => LifecyclePhase::Failed,
            "Terminating" | "Deleting" | "Terminated" => LifecyclePhase::Deleting,
            "Deleted" => LifecyclePhase::Deleted,
            _ => LifecyclePhase::Unknown,
        }
    }
}

impl std::fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_sub_clamps_at_zero() {
        let allocatable = ResourceQuantity::new(1000, 1024, 0);
        let used = ResourceQuantity::new(1500, 512, 1);
        assert_eq!(
            allocatable.saturating_sub(used),
            ResourceQuantity::new(0, 512, 0)
        );
    }

    #[test]
    fn quantity_sum_over_footprints() {
        let total: ResourceQuantity = [
            ResourceQuantity::new(100, 10, 0),
            ResourceQuantity::new(200, 20, 1),
        ]
        .into_iter()
        .sum();
        assert_eq!(total, ResourceQuantity::new(300, 30, 1));
    }

    #[test]
    fn status_phase_classification() {
        assert_eq!(NormalizedStatus::new("").phase(), LifecyclePhase::Creating);
        assert_eq!(
            NormalizedStatus::new("Running").phase(),
            LifecyclePhase::Running
        );
        assert_eq!(NormalizedStatus::new("ready").phase(), LifecyclePhase::Ready);
        assert_eq!(
            NormalizedStatus::new("unready").phase(),
            LifecyclePhase::Unready
        );
        assert_eq!(NormalizedStatus::deleted().phase(), LifecyclePhase::Deleted);
        assert_eq!(
            NormalizedStatus::new("Bogus").phase(),
            LifecyclePhase::Unknown
        );
    }

    #[test]
    fn workload_request_defaults_from_yaml_like_json() {
        let request: WorkloadRequest = serde_json::from_str(
            r#"{"kind":"session","name":"nb","owner":"alice","resources":{"cpu":"2"}}"#,
        )
        .expect("should deserialize");
        assert_eq!(request.kind, WorkloadKind::Session);
        assert!(request.namespace.is_empty());
        assert_eq!(request.resources.cpu.as_deref(), Some("2"));
        assert!(request.ports.is_empty());
    }
}
