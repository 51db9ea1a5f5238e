//! Model-serving deployment exposed through a node port service.

use std::collections::BTreeMap;

use api_types::WorkloadKind;
use api_types::WorkloadRequest;
use error_stack::Report;
use serde_json::json;

use super::dns_label;
use super::env_manifest;
use super::extra_mounts;
use super::resolve_image;
use super::resolve_namespace;
use super::AccessEndpoint;
use super::ContainerResources;
use super::Plan;
use super::ResourceUnit;
use crate::config::ServingConfig;
use crate::error::ProvisionError;
use crate::gateway::ObjectKind;
use crate::gateway::ObjectRef;

pub(super) fn plan(
    config: &ServingConfig,
    request: &WorkloadRequest,
) -> Result<Plan, Report<ProvisionError>> {
    let image = resolve_image(request, config.image.as_deref())?;
    let resources = ContainerResources::resolve(request, &config.cpu, &config.memory)?;
    let name = dns_label(&request.name, "name")?;
    let namespace = resolve_namespace(request, &config.namespace);
    let replicas = request
        .replicas
        .primary
        .filter(|count| *count > 0)
        .unwrap_or(config.replicas);

    let mut labels: BTreeMap<String, String> = request.labels.clone();
    labels.insert("app".to_string(), name.clone());

    let command = if request.command.is_empty() {
        vec!["tritonserver".to_string()]
    } else {
        request.command.clone()
    };
    let args = if request.args.is_empty() {
        vec![
            format!("--model-repository={}", config.model_repository),
            "--allow-gpu-metrics=false".to_string(),
            "--strict-model-config=false".to_string(),
        ]
    } else {
        request.args.clone()
    };
    let (volumes, volume_mounts) = extra_mounts(&request.mounts);

    let mut node_selector = config.node_selector.clone();
    node_selector.extend(request.node_selector.clone());

    let deployment = json!({
        "apiVersion": ObjectKind::DEPLOYMENT.api_version(),
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": name,
                        "image": image,
                        "imagePullPolicy": request
                            .image_pull_policy
                            .as_deref()
                            .unwrap_or(&config.image_pull_policy),
                        "command": command,
                        "args": args,
                        "ports": [
                            { "name": "http-triton", "containerPort": config.http_port },
                            { "name": "grpc-triton", "containerPort": config.grpc_port },
                            { "name": "metrics-triton", "containerPort": config.metrics_port },
                        ],
                        "env": env_manifest(&request.env),
                        "volumeMounts": volume_mounts,
                        "resources": resources.to_manifest(),
                    }],
                    "volumes": volumes,
                    "nodeSelector": node_selector,
                },
            },
        },
    });

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": {
            "type": "NodePort",
            "selector": labels,
            "ports": [
                { "name": "http-triton", "port": config.http_port, "targetPort": config.http_port, "protocol": "TCP" },
                { "name": "grpc-triton", "port": config.grpc_port, "targetPort": config.grpc_port, "protocol": "TCP" },
            ],
        },
    });

    Ok(Plan {
        workload: WorkloadKind::ServingDeployment,
        units: vec![
            ResourceUnit::new(ObjectKind::DEPLOYMENT, namespace, &name, deployment),
            ResourceUnit::new(ObjectKind::SERVICE, namespace, &name, service),
        ],
        access: Some(AccessEndpoint::NodePort {
            address: config.external_address.clone(),
            service: ObjectRef::new(ObjectKind::SERVICE, namespace, &name),
            fallback_port: config.http_port,
        }),
    })
}
