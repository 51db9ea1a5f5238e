//! Distributed training job: one PyTorchJob with Master and Worker replica groups.

use std::collections::BTreeMap;

use api_types::WorkloadKind;
use api_types::WorkloadRequest;
use error_stack::Report;
use serde_json::json;
use serde_json::Value;

use super::dns_label;
use super::env_manifest;
use super::extra_mounts;
use super::resolve_image;
use super::resolve_namespace;
use super::ContainerResources;
use super::Plan;
use super::ResourceUnit;
use crate::config::TrainingConfig;
use crate::error::ProvisionError;
use crate::gateway::ObjectKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplicaRole {
    Master,
    Worker,
}

impl ReplicaRole {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Master => "Master",
            Self::Worker => "Worker",
        }
    }
}

struct JobTemplate<'a> {
    config: &'a TrainingConfig,
    request: &'a WorkloadRequest,
    image: String,
    resources: ContainerResources,
    labels: BTreeMap<String, String>,
}

pub(super) fn plan(
    config: &TrainingConfig,
    request: &WorkloadRequest,
) -> Result<Plan, Report<ProvisionError>> {
    let image = resolve_image(request, config.image.as_deref())?;
    let resources = ContainerResources::resolve(request, &config.cpu, &config.memory)?;
    let name = dns_label(&request.name, "name")?;
    let namespace = resolve_namespace(request, &config.namespace);

    let mut labels: BTreeMap<String, String> = request.labels.clone();
    labels.insert("app".to_string(), name.clone());
    if !request.owner.trim().is_empty() {
        labels.insert("user".to_string(), dns_label(&request.owner, "owner")?);
    }

    let template = JobTemplate {
        config,
        request,
        image,
        resources,
        labels,
    };
    let master_replicas = replica_count(request.replicas.primary, config.master_replicas);
    let worker_replicas = replica_count(request.replicas.worker, config.worker_replicas);

    let job = json!({
        "apiVersion": ObjectKind::PYTORCH_JOB.api_version(),
        "kind": "PyTorchJob",
        "metadata": { "name": name, "namespace": namespace, "labels": template.labels },
        "spec": {
            "pytorchReplicaSpecs": {
                "Master": template.replica_spec(ReplicaRole::Master, master_replicas),
                "Worker": template.replica_spec(ReplicaRole::Worker, worker_replicas),
            },
        },
    });

    Ok(Plan {
        workload: WorkloadKind::TrainingJob,
        units: vec![ResourceUnit::new(ObjectKind::PYTORCH_JOB, namespace, &name, job)],
        access: None,
    })
}

fn replica_count(requested: Option<u32>, default: u32) -> u32 {
    requested.filter(|count| *count > 0).unwrap_or(default)
}

impl JobTemplate<'_> {
    fn replica_spec(&self, role: ReplicaRole, replicas: u32) -> Value {
        // MASTER_ADDR and MASTER_PORT are injected by the training operator
        // from the `pytorchjob-port` container port.
        let env = env_manifest(&self.request.env);

        let (volumes, volume_mounts) = extra_mounts(&self.request.mounts);
        let mut node_selector = self.config.node_selector.clone();
        node_selector.extend(self.request.node_selector.clone());

        let mut container = json!({
            "name": "pytorch",
            "image": self.image,
            "imagePullPolicy": self
                .request
                .image_pull_policy
                .as_deref()
                .unwrap_or(&self.config.image_pull_policy),
            "env": env,
            "ports": [{
                "name": "pytorchjob-port",
                "containerPort": self.config.rendezvous_port,
            }],
            "volumeMounts": volume_mounts,
            "resources": self.resources.to_manifest(),
        });
        // An empty command keeps the image entrypoint.
        if !self.request.command.is_empty() {
            container["command"] = json!(self.request.command);
        }
        if !self.request.args.is_empty() {
            container["args"] = json!(self.request.args);
        }

        json!({
            "replicas": replicas,
            "restartPolicy": self
                .request
                .restart_policy
                .as_deref()
                .unwrap_or(&self.config.restart_policy),
            "template": {
                "metadata": {
                    "labels": self.labels,
                    "annotations": { "replica-role": role.as_str() },
                },
                "spec": {
                    "containers": [container],
                    "volumes": volumes,
                    "nodeSelector": node_selector,
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use api_types::EnvVar;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::builder::tests::request;
    use crate::builder::ResourceSpecBuilder;

    fn training_plan(configure: impl FnOnce(&mut WorkloadRequest)) -> Plan {
        let mut req = request(WorkloadKind::TrainingJob, "pytorch/pytorch:2.1");
        req.name = "bert-finetune".to_string();
        req.command = vec!["torchrun".to_string()];
        req.args = vec!["train.py".to_string()];
        configure(&mut req);
        ResourceSpecBuilder::default().build(&req).unwrap()
    }

    fn replica<'a>(plan: &'a Plan, role: &str) -> &'a Value {
        &plan.units[0].spec["spec"]["pytorchReplicaSpecs"][role]
    }

    #[test]
    fn single_job_unit_with_both_roles() {
        let plan = training_plan(|_| {});
        assert_eq!(plan.units.len(), 1);
        assert_eq!(plan.units[0].kind, ObjectKind::PYTORCH_JOB);
        assert_eq!(plan.units[0].namespace, "train");
        assert_eq!(plan.units[0].spec["apiVersion"], "kubeflow.org/v1");
        assert!(replica(&plan, "Master").is_object());
        assert!(replica(&plan, "Worker").is_object());
        assert_eq!(plan.access, None);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let plan = training_plan(|_| {});
        let master = replica(&plan, "Master");
        let container = &master["template"]["spec"]["containers"][0];

        assert_eq!(master["replicas"], 1);
        assert_eq!(replica(&plan, "Worker")["replicas"], 1);
        assert_eq!(master["restartPolicy"], "OnFailure");
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["resources"]["limits"]["cpu"], "4");
        assert_eq!(container["resources"]["limits"]["memory"], "8Gi");
        assert_eq!(container["command"], json!(["torchrun"]));
    }

    #[test]
    fn requested_values_override_defaults() {
        let plan = training_plan(|req| {
            req.replicas.primary = Some(1);
            req.replicas.worker = Some(4);
            req.resources.gpu = Some(2);
            req.restart_policy = Some("Never".to_string());
            req.node_selector.insert("gpu-type".to_string(), "a100".to_string());
        });
        let worker = replica(&plan, "Worker");
        assert_eq!(worker["replicas"], 4);
        assert_eq!(worker["restartPolicy"], "Never");
        assert_eq!(
            worker["template"]["spec"]["containers"][0]["resources"]["requests"]["nvidia.com/gpu"],
            "2"
        );
        assert_eq!(worker["template"]["spec"]["nodeSelector"]["gpu-type"], "a100");
    }

    #[test]
    fn replicas_carry_only_user_env() {
        let plan = training_plan(|req| {
            req.env.push(EnvVar {
                name: "NCCL_DEBUG".to_string(),
                value: "INFO".to_string(),
            });
        });
        for role in ["Master", "Worker"] {
            let container = &replica(&plan, role)["template"]["spec"]["containers"][0];
            assert_eq!(
                container["env"],
                json!([{ "name": "NCCL_DEBUG", "value": "INFO" }]),
                "{role} env"
            );
            assert_eq!(
                container["ports"],
                json!([{ "name": "pytorchjob-port", "containerPort": 29500 }]),
                "{role} ports"
            );
        }
    }

    #[test]
    fn user_label_is_sanitized_and_optional() {
        let plan = training_plan(|req| req.owner = "Bob.Jones@lab".to_string());
        assert_eq!(plan.units[0].spec["metadata"]["labels"]["user"], "bob-jones-lab");

        let plan = training_plan(|req| req.owner.clear());
        assert!(plan.units[0].spec["metadata"]["labels"].get("user").is_none());
    }

    #[test]
    fn empty_command_keeps_entrypoint() {
        let plan = training_plan(|req| req.command.clear());
        let container = &replica(&plan, "Master")["template"]["spec"]["containers"][0];
        assert!(container.get("command").is_none());
    }
}
