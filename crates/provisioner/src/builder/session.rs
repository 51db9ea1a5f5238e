//! Interactive notebook session: pod, service, then route.

use std::collections::BTreeMap;

use api_types::WorkloadKind;
use api_types::WorkloadRequest;
use error_stack::Report;
use serde_json::json;
use serde_json::Value;

use super::dns_label;
use super::env_manifest;
use super::extra_mounts;
use super::field_ref_env;
use super::resolve_image;
use super::resolve_namespace;
use super::AccessEndpoint;
use super::ContainerResources;
use super::FailurePolicy;
use super::Plan;
use super::ResourceUnit;
use crate::config::SessionConfig;
use crate::error::ProvisionError;
use crate::gateway::ObjectKind;

const DEFAULT_RESTART_POLICY: &str = "Never";
const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

/// Path prefix the route matches and the notebook server is rooted at.
pub(crate) fn base_path(namespace: &str, name: &str) -> String {
    format!("/notebook/{namespace}/{name}/")
}

pub(super) fn plan(
    config: &SessionConfig,
    request: &WorkloadRequest,
    suffix: &str,
) -> Result<Plan, Report<ProvisionError>> {
    let image = resolve_image(request, config.image.as_deref())?;
    let resources = ContainerResources::resolve(request, &config.cpu, &config.memory)?;
    let owner = dns_label(&request.owner, "owner")?;
    let namespace = resolve_namespace(request, &config.namespace);
    let port = request.ports.first().copied().unwrap_or(config.service_port);
    if port == 0 {
        return Err(Report::new(ProvisionError::validation(
            "session port must be non-zero",
        )));
    }

    let name = format!("{owner}-{suffix}");
    let service_name = format!("{name}-svc");
    let base_path = base_path(namespace, &name);

    let mut labels: BTreeMap<String, String> = request.labels.clone();
    labels.insert("app".to_string(), name.clone());
    labels.insert("pod-type".to_string(), "notebook".to_string());
    labels.insert("user".to_string(), owner.clone());

    let pod = pod_manifest(
        config, request, &image, &resources, &owner, namespace, &name, &labels, port, &base_path,
    );
    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": service_name, "namespace": namespace, "labels": labels },
        "spec": {
            "type": config.service_type.as_str(),
            "selector": labels,
            "ports": [{
                "name": "http0",
                "port": port,
                "targetPort": port,
                "protocol": "TCP",
            }],
        },
    });
    let route = json!({
        "apiVersion": ObjectKind::VIRTUAL_SERVICE.api_version(),
        "kind": "VirtualService",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": {
            "gateways": [config.route_gateway],
            "hosts": [config.route_host],
            "http": [{
                "match": [{ "uri": { "prefix": base_path } }],
                "rewrite": { "uri": base_path },
                "route": [{
                    "destination": {
                        "host": format!("{service_name}.{namespace}.svc.cluster.local"),
                        "port": { "number": port },
                    },
                }],
                "timeout": config.route_timeout,
            }],
        },
    });

    let route_policy = if config.rollback_on_route_failure {
        FailurePolicy::RollBackCreated
    } else {
        FailurePolicy::KeepCreated
    };

    Ok(Plan {
        workload: WorkloadKind::Session,
        units: vec![
            ResourceUnit::new(ObjectKind::POD, namespace, &name, pod),
            ResourceUnit::new(ObjectKind::SERVICE, namespace, &service_name, service),
            ResourceUnit::new(ObjectKind::VIRTUAL_SERVICE, namespace, &name, route)
                .with_failure_policy(route_policy),
        ],
        access: Some(AccessEndpoint::Url(format!(
            "http://{}{base_path}lab",
            config.external_address
        ))),
    })
}

#[allow(clippy::too_many_arguments)]
fn pod_manifest(
    config: &SessionConfig,
    request: &WorkloadRequest,
    image: &str,
    resources: &ContainerResources,
    owner: &str,
    namespace: &str,
    name: &str,
    labels: &BTreeMap<String, String>,
    port: u16,
    base_path: &str,
) -> Value {
    let workspace = format!("{}/{owner}", config.workspace_root);
    let archive = format!("{}/{owner}", config.archive_root);

    let command = if request.command.is_empty() {
        vec!["sh".to_string(), "-c".to_string()]
    } else {
        request.command.clone()
    };
    let args = if request.args.is_empty() {
        vec![format!(
            "jupyter lab --notebook-dir={workspace} --ip=0.0.0.0 --no-browser --allow-root \
             --port={port} --NotebookApp.token='' --NotebookApp.password='' \
             --ServerApp.disable_check_xsrf=True --NotebookApp.allow_origin='*' \
             --NotebookApp.base_url={base_path}"
        )]
    } else {
        request.args.clone()
    };

    let mut volumes = vec![
        json!({ "name": "workspace", "persistentVolumeClaim": { "claimName": config.workspace_claim } }),
        json!({ "name": "archives", "persistentVolumeClaim": { "claimName": config.archive_claim } }),
        json!({ "name": "tz-config", "hostPath": { "path": "/etc/localtime" } }),
        json!({ "name": "dshm", "emptyDir": { "medium": "Memory" } }),
    ];
    let mut volume_mounts = vec![
        json!({ "name": "workspace", "mountPath": workspace, "subPath": owner }),
        json!({ "name": "archives", "mountPath": archive, "subPath": owner }),
        json!({ "name": "tz-config", "mountPath": "/etc/localtime" }),
        json!({ "name": "dshm", "mountPath": "/dev/shm" }),
    ];
    let (extra_volumes, extra_volume_mounts) = extra_mounts(&request.mounts);
    volumes.extend(extra_volumes);
    volume_mounts.extend(extra_volume_mounts);

    let mut env = vec![
        json!({ "name": "USERNAME", "value": request.owner }),
        field_ref_env("K8S_NODE_NAME", "spec.nodeName"),
        field_ref_env("K8S_POD_NAMESPACE", "metadata.namespace"),
        field_ref_env("K8S_POD_IP", "status.podIP"),
        field_ref_env("K8S_HOST_IP", "status.hostIP"),
        field_ref_env("K8S_POD_NAME", "metadata.name"),
    ];
    env.extend(env_manifest(&request.env));

    let mut node_selector = config.node_selector.clone();
    node_selector.extend(request.node_selector.clone());

    let mut pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": {
            "containers": [{
                "name": name,
                "image": image,
                "imagePullPolicy": request.image_pull_policy.as_deref().unwrap_or(DEFAULT_PULL_POLICY),
                "command": command,
                "args": args,
                "workingDir": workspace,
                "ports": [{ "name": "http", "containerPort": port }],
                "env": env,
                "volumeMounts": volume_mounts,
                "resources": resources.to_manifest(),
            }],
            "volumes": volumes,
            "restartPolicy": request.restart_policy.as_deref().unwrap_or(DEFAULT_RESTART_POLICY),
            "nodeSelector": node_selector,
            "serviceAccountName": "default",
        },
    });

    if let Some(secret) = &config.image_pull_secret {
        pod["spec"]["imagePullSecrets"] = json!([{ "name": secret }]);
    }
    if let Some(scheduler) = &config.scheduler_name {
        pod["spec"]["schedulerName"] = Value::from(scheduler.as_str());
    }
    pod
}
