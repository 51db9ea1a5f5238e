//! Translation of a [`WorkloadRequest`] into an ordered plan of cluster objects.
//!
//! The builder never talks to the cluster. Everything it needs beyond the
//! request comes from the resolved [`ProvisionerConfig`].

use api_types::EnvVar;
use api_types::MountSpec;
use api_types::ResourceQuantity;
use api_types::WorkloadKind;
use api_types::WorkloadRequest;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::json;
use serde_json::Map;
use serde_json::Value;

use crate::config::ProvisionerConfig;
use crate::error::ProvisionError;
use crate::gateway::ObjectKind;
use crate::gateway::ObjectRef;
use crate::quantity::parse_cpu_millis;
use crate::quantity::parse_memory_bytes;
use crate::quantity::GPU_RESOURCE_NAME;

mod serving;
mod session;
mod training;

/// Length of the random suffix appended to session object names.
const SUFFIX_LEN: usize = 5;

/// Longest name we hand out, leaving room for `-svc` under the 63 char label limit.
const MAX_NAME_LEN: usize = 52;

/// What the orchestrator does with earlier units when this unit fails to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Delete every already created unit in reverse order
    #[default]
    RollBackCreated,
    /// Leave earlier units in place; the caller cleans up with a teardown
    KeepCreated,
}

/// Compensating action for a created unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    Delete(ObjectRef),
}

/// One object to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUnit {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    /// Full manifest including `apiVersion`, `kind` and `metadata`
    pub spec: Value,
    pub rollback: Option<RollbackAction>,
    pub on_failure: FailurePolicy,
}

impl ResourceUnit {
    /// A unit whose rollback deletes it by name and namespace.
    pub fn new(kind: ObjectKind, namespace: &str, name: &str, spec: Value) -> Self {
        let target = ObjectRef::new(kind.clone(), namespace, name);
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            spec,
            rollback: Some(RollbackAction::Delete(target)),
            on_failure: FailurePolicy::RollBackCreated,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind.clone(), &self.namespace, &self.name)
    }
}

/// How callers reach a provisioned workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessEndpoint {
    /// Known at build time
    Url(String),
    /// Resolved after creation from the node port the cluster assigned to `service`
    NodePort {
        address: String,
        service: ObjectRef,
        fallback_port: u16,
    },
}

/// Ordered units for one workload plus its access endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub workload: WorkloadKind,
    pub units: Vec<ResourceUnit>,
    pub access: Option<AccessEndpoint>,
}

impl Plan {
    pub fn object_refs(&self) -> Vec<ObjectRef> {
        self.units.iter().map(ResourceUnit::object_ref).collect()
    }
}

/// Container resources after defaults, with requests equal to limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContainerResources {
    pub cpu: String,
    pub memory: String,
    pub gpu: u64,
    pub quantity: ResourceQuantity,
}

impl ContainerResources {
    fn resolve(
        request: &WorkloadRequest,
        default_cpu: &str,
        default_memory: &str,
    ) -> Result<Self, Report<ProvisionError>> {
        let cpu = non_empty(request.resources.cpu.as_deref()).unwrap_or(default_cpu);
        let memory = non_empty(request.resources.memory.as_deref()).unwrap_or(default_memory);
        let gpu = request.resources.gpu.unwrap_or(0);

        let cpu_milli_cores = parse_cpu_millis(cpu)
            .change_context_lazy(|| ProvisionError::validation(format!("invalid cpu quantity {cpu:?}")))?;
        let memory_bytes = parse_memory_bytes(memory).change_context_lazy(|| {
            ProvisionError::validation(format!("invalid memory quantity {memory:?}"))
        })?;

        Ok(Self {
            cpu: cpu.trim().to_string(),
            memory: memory.trim().to_string(),
            gpu,
            quantity: ResourceQuantity::new(cpu_milli_cores, memory_bytes, gpu),
        })
    }

    /// `resources` block of a container spec. GPUs appear only when requested.
    pub fn to_manifest(&self) -> Value {
        let mut amounts = Map::new();
        amounts.insert("cpu".to_string(), Value::from(self.cpu.as_str()));
        amounts.insert("memory".to_string(), Value::from(self.memory.as_str()));
        if self.gpu > 0 {
            amounts.insert(GPU_RESOURCE_NAME.to_string(), Value::from(self.gpu.to_string()));
        }
        json!({ "limits": amounts.clone(), "requests": amounts })
    }
}

/// Builds plans from workload requests.
#[derive(Debug, Clone, Default)]
pub struct ResourceSpecBuilder {
    config: ProvisionerConfig,
}

impl ResourceSpecBuilder {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Build the plan for `request`, naming sessions with a fresh random suffix.
    pub fn build(&self, request: &WorkloadRequest) -> Result<Plan, Report<ProvisionError>> {
        self.build_with_suffix(request, &random_suffix())
    }

    /// Build with a caller-chosen session suffix, so a plan can be rebuilt
    /// with the object names of an earlier build.
    pub fn build_with_suffix(
        &self,
        request: &WorkloadRequest,
        suffix: &str,
    ) -> Result<Plan, Report<ProvisionError>> {
        let plan = match request.kind {
            WorkloadKind::Session => session::plan(&self.config.session, request, suffix),
            WorkloadKind::ServingDeployment => serving::plan(&self.config.serving, request),
            WorkloadKind::TrainingJob => training::plan(&self.config.training, request),
        }
        .attach_printable_lazy(|| format!("workload kind: {}", request.kind))?;
        Ok(plan)
    }

    /// Footprint of the largest single pod the request creates.
    ///
    /// Admission asks whether one node can host this pod; replicas of the
    /// same workload are checked one pod at a time.
    pub fn resource_request(
        &self,
        request: &WorkloadRequest,
    ) -> Result<ResourceQuantity, Report<ProvisionError>> {
        let (cpu, memory) = match request.kind {
            WorkloadKind::Session => (&self.config.session.cpu, &self.config.session.memory),
            WorkloadKind::ServingDeployment => (&self.config.serving.cpu, &self.config.serving.memory),
            WorkloadKind::TrainingJob => (&self.config.training.cpu, &self.config.training.memory),
        };
        Ok(ContainerResources::resolve(request, cpu, memory)?.quantity)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Request image, else the configured default. Empty is a validation error.
fn resolve_image(request: &WorkloadRequest, default: Option<&str>) -> Result<String, Report<ProvisionError>> {
    non_empty(Some(request.image.as_str()))
        .or_else(|| non_empty(default))
        .map(|image| image.trim().to_string())
        .ok_or_else(|| Report::new(ProvisionError::validation("image must not be empty")))
}

/// Request namespace, else the configured default for the kind.
fn resolve_namespace<'a>(request: &'a WorkloadRequest, default: &'a str) -> &'a str {
    non_empty(Some(request.namespace.as_str())).unwrap_or(default)
}

fn random_suffix() -> String {
    let mut suffix = uuid::Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    suffix
}

/// Lowercase RFC 1123 label derived from `raw`.
///
/// Runs of characters outside `[a-z0-9]` collapse to one `-`, and the result
/// never starts or ends with `-`.
fn dns_label(raw: &str, field: &str) -> Result<String, Report<ProvisionError>> {
    let mut label = String::with_capacity(raw.len());
    for c in raw.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            label.push(c);
        } else if !label.is_empty() && !label.ends_with('-') {
            label.push('-');
        }
    }
    label.truncate(MAX_NAME_LEN);
    let label = label.trim_end_matches('-').to_string();

    if label.is_empty() {
        return Err(Report::new(ProvisionError::validation(format!(
            "{field} {raw:?} does not contain any valid name characters"
        ))));
    }
    Ok(label)
}

fn env_manifest(env: &[EnvVar]) -> Vec<Value> {
    env.iter()
        .map(|var| json!({ "name": var.name, "value": var.value }))
        .collect()
}

fn field_ref_env(name: &str, field_path: &str) -> Value {
    json!({
        "name": name,
        "valueFrom": { "fieldRef": { "fieldPath": field_path } }
    })
}

/// Volumes and mounts for caller-requested claims, named `mount-<n>`.
fn extra_mounts(mounts: &[MountSpec]) -> (Vec<Value>, Vec<Value>) {
    mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| {
            let volume_name = format!("mount-{index}");
            let volume = json!({
                "name": volume_name,
                "persistentVolumeClaim": { "claimName": mount.claim_name }
            });
            let mut volume_mount = json!({
                "name": volume_name,
                "mountPath": mount.mount_path,
                "readOnly": mount.read_only,
            });
            if let Some(sub_path) = &mount.sub_path {
                volume_mount["subPath"] = Value::from(sub_path.as_str());
            }
            (volume, volume_mount)
        })
        .unzip()
}
