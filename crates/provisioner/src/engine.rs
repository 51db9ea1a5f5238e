//! Provisioner facade composing admission, plan building, orchestration and
//! status normalization over one explicitly passed cluster gateway.

use api_types::NormalizedStatus;
use api_types::ResourceQuantity;
use api_types::WorkloadKind;
use api_types::WorkloadRequest;
use error_stack::Report;
use error_stack::ResultExt;
use serde_json::Map;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::admission::AdmissionController;
use crate::builder::AccessEndpoint;
use crate::builder::Plan;
use crate::builder::ResourceSpecBuilder;
use crate::config::ProvisionerConfig;
use crate::error::ProvisionError;
use crate::gateway::ClusterGateway;
use crate::gateway::ObjectKind;
use crate::gateway::ObjectRef;
use crate::orchestrator::ProvisionResult;
use crate::orchestrator::ProvisioningOrchestrator;
use crate::quantity::parse_cpu_millis;
use crate::quantity::parse_memory_bytes;
use crate::quantity::GPU_RESOURCE_NAME;
use crate::status::StatusReconciler;

/// Result of [`Provisioner::provision`].
#[derive(Debug)]
pub enum ProvisionOutcome {
    /// No single node has room; nothing was created
    Denied { request: ResourceQuantity },
    Applied(ProvisionResult),
}

/// Changes to a running session. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub gpu: Option<u64>,
    pub service_port: Option<u16>,
}

impl SessionUpdate {
    fn touches_resources(&self) -> bool {
        self.cpu.is_some() || self.memory.is_some() || self.gpu.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_resources() && self.service_port.is_none()
    }
}

pub struct Provisioner<G> {
    admission: AdmissionController<G>,
    builder: ResourceSpecBuilder,
    orchestrator: ProvisioningOrchestrator<G>,
    reconciler: StatusReconciler,
}

impl<G: ClusterGateway + Clone> Provisioner<G> {
    pub fn new(gateway: G, config: ProvisionerConfig) -> Self {
        Self {
            admission: AdmissionController::new(gateway.clone()),
            builder: ResourceSpecBuilder::new(config),
            orchestrator: ProvisioningOrchestrator::new(gateway),
            reconciler: StatusReconciler::default(),
        }
    }

    pub fn with_reconciler(mut self, reconciler: StatusReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn admission(&self) -> &AdmissionController<G> {
        &self.admission
    }

    pub fn builder(&self) -> &ResourceSpecBuilder {
        &self.builder
    }

    pub fn orchestrator(&self) -> &ProvisioningOrchestrator<G> {
        &self.orchestrator
    }

    /// Validate, admit, build and create the objects for `request`.
    ///
    /// Validation errors are returned before any cluster call. Failures after
    /// admission are reported inside the [`ProvisionResult`], together with
    /// whatever is left on the cluster.
    pub async fn provision(
        &self,
        request: &WorkloadRequest,
    ) -> Result<ProvisionOutcome, Report<ProvisionError>> {
        self.provision_until_cancelled(request, &CancellationToken::new())
            .await
    }

    #[tracing::instrument(skip_all, fields(kind = %request.kind, name = %request.name, owner = %request.owner))]
    pub async fn provision_until_cancelled(
        &self,
        request: &WorkloadRequest,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, Report<ProvisionError>> {
        let plan = self.builder.build(request)?;
        let footprint = self.builder.resource_request(request)?;

        if !self.admission.check(&footprint).await? {
            info!(request = %footprint, "Request denied by admission");
            return Ok(ProvisionOutcome::Denied { request: footprint });
        }

        Ok(ProvisionOutcome::Applied(self.apply_plan(&plan, cancel).await))
    }

    async fn apply_plan(&self, plan: &Plan, cancel: &CancellationToken) -> ProvisionResult {
        let mut result = self
            .orchestrator
            .apply_until_cancelled(&plan.units, cancel)
            .await;
        if result.is_success() {
            result.access_endpoint = self.resolve_access(plan.access.as_ref()).await;
        }
        result
    }

    async fn resolve_access(&self, access: Option<&AccessEndpoint>) -> Option<String> {
        match access? {
            AccessEndpoint::Url(url) => Some(url.clone()),
            AccessEndpoint::NodePort {
                address,
                service,
                fallback_port,
            } => {
                let port = match self
                    .orchestrator
                    .gateway()
                    .get_object(&service.namespace, &service.kind, &service.name)
                    .await
                {
                    Ok(object) => first_node_port(&object).unwrap_or(*fallback_port),
                    Err(err) => {
                        warn!(service = %service, "Failed to read assigned node port: {err:?}");
                        *fallback_port
                    }
                };
                Some(format!("http://{address}:{port}"))
            }
        }
    }

    /// Normalized status of a live object. A missing object reports
    /// [`NormalizedStatus::deleted`].
    #[tracing::instrument(skip(self, kind), fields(kind = %kind))]
    pub async fn status(
        &self,
        kind: &ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<NormalizedStatus, Report<ProvisionError>> {
        match self
            .orchestrator
            .gateway()
            .get_object(namespace, kind, name)
            .await
        {
            Ok(object) => self.reconciler.normalize(kind, &object),
            Err(err) if err.current_context().is_not_found() => Ok(NormalizedStatus::deleted()),
            Err(err) => Err(err.change_context(ProvisionError::transport(format!(
                "failed to get {kind} {namespace}/{name}"
            )))),
        }
    }

    pub async fn teardown(&self, units: &[ObjectRef]) -> Result<(), Report<ProvisionError>> {
        self.orchestrator.teardown(units).await
    }

    /// Delete a workload and create it again under the same names.
    ///
    /// Sessions keep the suffix found on the recorded pod, so the access URL
    /// does not change. No admission check runs.
    #[tracing::instrument(skip_all, fields(kind = %request.kind, units = units.len()))]
    pub async fn reset(
        &self,
        request: &WorkloadRequest,
        units: &[ObjectRef],
    ) -> Result<ProvisionResult, Report<ProvisionError>> {
        let plan = match session_suffix(request.kind, units) {
            Some(suffix) => self.builder.build_with_suffix(request, suffix)?,
            None => self.builder.build(request)?,
        };

        self.orchestrator
            .teardown(units)
            .await
            .attach_printable("failed to remove the workload before reset")?;
        Ok(self.apply_plan(&plan, &CancellationToken::new()).await)
    }

    /// Apply `update` to the session recorded in `units`.
    ///
    /// New resources recreate the pod, so the session is unavailable until
    /// the replacement starts. A new service port is patched in place on the
    /// service and the route destination.
    #[tracing::instrument(skip_all, fields(units = units.len()))]
    pub async fn update_session(
        &self,
        units: &[ObjectRef],
        update: &SessionUpdate,
    ) -> Result<Vec<ObjectRef>, Report<ProvisionError>> {
        if update.is_empty() {
            info!("No changes to apply");
            return Ok(Vec::new());
        }
        let find = |kind: &ObjectKind| units.iter().find(|unit| unit.kind == *kind);

        let resources = if update.touches_resources() {
            let pod = find(&ObjectKind::POD).ok_or_else(|| {
                Report::new(ProvisionError::validation("no session pod among the units"))
            })?;
            Some((pod, resource_changes(update)?))
        } else {
            None
        };
        let port = match update.service_port {
            Some(0) => {
                return Err(Report::new(ProvisionError::validation(
                    "service port must be non-zero",
                )))
            }
            Some(port) => {
                let service = find(&ObjectKind::SERVICE).ok_or_else(|| {
                    Report::new(ProvisionError::validation("no session service among the units"))
                })?;
                Some((service, port))
            }
            None => None,
        };

        let mut replaced = Vec::new();
        if let Some((pod, changes)) = resources {
            let mut manifest = self.fetch_manifest(pod).await?;
            set_container_resources(&mut manifest, &changes, update.gpu)?;
            replaced.push(self.orchestrator.replace(pod, &manifest).await?);
        }

        if let Some((service, port)) = port {
            let mut manifest = self.fetch_manifest(service).await?;
            if let Some(first) = manifest.pointer_mut("/spec/ports/0") {
                first["port"] = Value::from(port);
            }
            replaced.push(self.orchestrator.replace(service, &manifest).await?);

            if let Some(route) = find(&ObjectKind::VIRTUAL_SERVICE) {
                let mut manifest = self.fetch_manifest(route).await?;
                if let Some(destination) =
                    manifest.pointer_mut("/spec/http/0/route/0/destination/port")
                {
                    destination["number"] = Value::from(port);
                }
                replaced.push(self.orchestrator.replace(route, &manifest).await?);
            }
        }

        Ok(replaced)
    }

    /// Live object with the server-populated fields removed, ready to submit again.
    async fn fetch_manifest(&self, target: &ObjectRef) -> Result<Value, Report<ProvisionError>> {
        let object = self
            .orchestrator
            .gateway()
            .get_object(&target.namespace, &target.kind, &target.name)
            .await
            .change_context_lazy(|| ProvisionError::transport(format!("failed to get {target}")))?;
        Ok(strip_server_fields(object))
    }
}

/// Suffix of the recorded session pod, `<owner>-<suffix>`.
fn session_suffix(kind: WorkloadKind, units: &[ObjectRef]) -> Option<&str> {
    if kind != WorkloadKind::Session {
        return None;
    }
    units
        .iter()
        .find(|unit| unit.kind == ObjectKind::POD)
        .and_then(|pod| pod.name.rsplit_once('-'))
        .map(|(_, suffix)| suffix)
}

fn first_node_port(service: &Value) -> Option<u16> {
    service
        .pointer("/spec/ports/0/nodePort")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .filter(|port| *port != 0)
}

fn strip_server_fields(mut object: Value) -> Value {
    if let Some(fields) = object.as_object_mut() {
        fields.remove("status");
    }
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in [
            "resourceVersion",
            "uid",
            "creationTimestamp",
            "generation",
            "managedFields",
            "selfLink",
        ] {
            metadata.remove(field);
        }
    }
    object
}

/// Validated cpu and memory values from `update`, keyed by resource name.
fn resource_changes(update: &SessionUpdate) -> Result<Map<String, Value>, Report<ProvisionError>> {
    let mut changes = Map::new();
    if let Some(cpu) = &update.cpu {
        parse_cpu_millis(cpu)
            .change_context_lazy(|| ProvisionError::validation(format!("invalid cpu quantity {cpu:?}")))?;
        changes.insert("cpu".to_string(), Value::from(cpu.trim()));
    }
    if let Some(memory) = &update.memory {
        parse_memory_bytes(memory).change_context_lazy(|| {
            ProvisionError::validation(format!("invalid memory quantity {memory:?}"))
        })?;
        changes.insert("memory".to_string(), Value::from(memory.trim()));
    }
    Ok(changes)
}

fn set_container_resources(
    manifest: &mut Value,
    changes: &Map<String, Value>,
    gpu: Option<u64>,
) -> Result<(), Report<ProvisionError>> {
    let container = manifest
        .pointer_mut("/spec/containers/0")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Report::new(ProvisionError::validation("session pod has no container")))?;
    let resources = container
        .entry("resources")
        .or_insert_with(|| Value::Object(Map::new()));

    for section in ["limits", "requests"] {
        let Some(resources) = resources.as_object_mut() else {
            continue;
        };
        let amounts = resources
            .entry(section)
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(amounts) = amounts.as_object_mut() else {
            continue;
        };
        amounts.extend(changes.clone());
        match gpu {
            Some(0) => {
                amounts.remove(GPU_RESOURCE_NAME);
            }
            Some(gpu) => {
                amounts.insert(GPU_RESOURCE_NAME.to_string(), Value::from(gpu.to_string()));
            }
            None => {}
        }
    }
    Ok(())
}
