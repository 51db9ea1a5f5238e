use std::collections::BTreeMap;

use api_types::NodeView;
use api_types::PodFootprint;
use api_types::ResourceQuantity;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::Api;
use kube::api::DeleteParams;
use kube::api::DynamicObject;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::ClusterGateway;
use super::GatewayError;
use super::ObjectKind;
use super::ObjectRef;
use crate::quantity::parse_count;
use crate::quantity::parse_cpu_millis;
use crate::quantity::parse_memory_bytes;
use crate::quantity::GPU_RESOURCE_NAME;

const FIELD_MANAGER: &str = "provisioner";

/// [`ClusterGateway`] backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic_api(&self, namespace: &str, kind: &ObjectKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }
}

fn api_resource(kind: &ObjectKind) -> ApiResource {
    ApiResource {
        group: kind.group.to_string(),
        version: kind.version.to_string(),
        api_version: kind.api_version(),
        kind: kind.kind.to_string(),
        plural: kind.plural.to_string(),
    }
}

fn to_dynamic(spec: &Value) -> Result<DynamicObject, Report<GatewayError>> {
    serde_json::from_value(spec.clone()).change_context(GatewayError::InvalidObject {
        message: "manifest is not a valid Kubernetes object".to_string(),
    })
}

/// Map a kube client error onto the gateway taxonomy.
fn map_kube_error(err: kube::Error, kind: &ObjectKind, namespace: &str, name: &str) -> Report<GatewayError> {
    let context = match &err {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            GatewayError::not_found(kind, namespace, name)
        }
        kube::Error::Api(api_err) if api_err.code == 409 => {
            GatewayError::already_exists(kind, namespace, name)
        }
        _ => GatewayError::Transport {
            message: format!("{kind} {namespace}/{name}: {err}"),
        },
    };
    Report::new(err).change_context(context)
}

#[async_trait::async_trait]
impl ClusterGateway for KubeGateway {
    async fn create_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>> {
        let object = to_dynamic(spec)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        debug!(%kind, namespace, name = %name, "Creating object");

        let created = self
            .dynamic_api(namespace, kind)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_kube_error(e, kind, namespace, &name))?;

        Ok(ObjectRef::new(
            kind.clone(),
            namespace,
            created.metadata.name.unwrap_or(name),
        ))
    }

    async fn get_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<Value, Report<GatewayError>> {
        let object = self
            .dynamic_api(namespace, kind)
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, kind, namespace, name))?;

        serde_json::to_value(object).change_context(GatewayError::InvalidObject {
            message: format!("failed to serialize {kind} {namespace}/{name}"),
        })
    }

    async fn delete_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<(), Report<GatewayError>> {
        debug!(%kind, namespace, name, "Deleting object");
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        self.dynamic_api(namespace, kind)
            .delete(name, &params)
            .await
            .map_err(|e| map_kube_error(e, kind, namespace, name))?;
        Ok(())
    }

    async fn update_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>> {
        let object = to_dynamic(spec)?;
        debug!(%kind, namespace, name, "Applying object");

        self.dynamic_api(namespace, kind)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await
            .map_err(|e| map_kube_error(e, kind, namespace, name))?;

        Ok(ObjectRef::new(kind.clone(), namespace, name))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeView>, Report<GatewayError>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .change_context(GatewayError::Transport {
                message: "failed to list nodes".to_string(),
            })?;

        list.items.iter().map(node_view).collect()
    }

    async fn list_pods_on_node(
        &self,
        node_name: &str,
    ) -> Result<Vec<PodFootprint>, Report<GatewayError>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let list = pods
            .list(&params)
            .await
            .change_context(GatewayError::Transport {
                message: format!("failed to list pods on node {node_name}"),
            })?;

        list.items
            .iter()
            .map(|pod| pod_footprint(node_name, pod))
            .collect()
    }
}

/// Build a [`NodeView`] from a node's allocatable capacity and addresses.
///
/// A node without the GPU key advertises zero GPUs.
fn node_view(node: &Node) -> Result<NodeView, Report<GatewayError>> {
    let name = node.metadata.name.clone().unwrap_or_default();
    let status = node.status.as_ref();

    let allocatable = match status.and_then(|s| s.allocatable.as_ref()) {
        Some(allocatable) => quantity_from_map(allocatable)
            .attach_printable_lazy(|| format!("node {name} allocatable"))?,
        None => ResourceQuantity::ZERO,
    };

    let internal_address = status
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|address| address.type_ == "InternalIP")
                .map(|address| address.address.clone())
        });

    Ok(NodeView {
        name,
        internal_address,
        allocatable,
    })
}

/// Sum the resource requests (not limits) of every container in a pod.
fn pod_footprint(node_name: &str, pod: &Pod) -> Result<PodFootprint, Report<GatewayError>> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let mut requested = ResourceQuantity::ZERO;

    for container in pod.spec.iter().flat_map(|spec| spec.containers.iter()) {
        if let Some(requests) = container
            .resources
            .as_ref()
            .and_then(|resources| resources.requests.as_ref())
        {
            let container_requests = quantity_from_map(requests)
                .attach_printable_lazy(|| format!("pod {pod_name} container {}", container.name))?;
            requested = requested.saturating_add(container_requests);
        }
    }

    Ok(PodFootprint {
        node_name: node_name.to_string(),
        requested,
    })
}

fn quantity_from_map(
    map: &BTreeMap<String, Quantity>,
) -> Result<ResourceQuantity, Report<GatewayError>> {
    let invalid = || GatewayError::InvalidObject {
        message: "unparseable resource quantity".to_string(),
    };

    let cpu_milli_cores = match map.get("cpu") {
        Some(q) => parse_cpu_millis(&q.0).change_context_lazy(invalid)?,
        None => 0,
    };
    let memory_bytes = match map.get("memory") {
        Some(q) => parse_memory_bytes(&q.0).change_context_lazy(invalid)?,
        None => 0,
    };
    let gpu_units = match map.get(GPU_RESOURCE_NAME) {
        Some(q) => parse_count(&q.0).change_context_lazy(invalid)?,
        None => 0,
    };

    Ok(ResourceQuantity::new(cpu_milli_cores, memory_bytes, gpu_units))
}
