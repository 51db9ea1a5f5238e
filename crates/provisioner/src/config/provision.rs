use std::collections::BTreeMap;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ProvisionError;

/// Static values the spec builder consumes, resolved once at startup.
///
/// Every field has a default, so an empty YAML document is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisionerConfig {
    pub session: SessionConfig,
    pub serving: ServingConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    NodePort,
    ClusterIP,
}

impl ServiceType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NodePort => "NodePort",
            Self::ClusterIP => "ClusterIP",
        }
    }
}

/// Interactive notebook sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub namespace: String,
    /// Used when the request carries no image
    pub image: Option<String>,
    pub cpu: String,
    pub memory: String,
    pub service_port: u16,
    pub service_type: ServiceType,
    /// Claim holding per-owner workspaces, mounted with the owner as sub-path
    pub workspace_claim: String,
    pub workspace_root: String,
    pub archive_claim: String,
    pub archive_root: String,
    pub route_gateway: String,
    pub route_host: String,
    pub route_timeout: String,
    /// Address callers use to reach the route gateway
    pub external_address: String,
    pub node_selector: BTreeMap<String, String>,
    pub scheduler_name: Option<String>,
    pub image_pull_secret: Option<String>,
    /// Retract pod and service when the route cannot be created
    pub rollback_on_route_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: "jupyter".to_string(),
            image: None,
            cpu: "1".to_string(),
            memory: "2Gi".to_string(),
            service_port: 3000,
            service_type: ServiceType::NodePort,
            workspace_claim: "user-workspace".to_string(),
            workspace_root: "/mnt".to_string(),
            archive_claim: "archives".to_string(),
            archive_root: "/archives".to_string(),
            route_gateway: "kubeflow/kubeflow-gateway".to_string(),
            route_host: "*".to_string(),
            route_timeout: "300s".to_string(),
            external_address: "127.0.0.1".to_string(),
            node_selector: BTreeMap::from([("notebook".to_string(), "true".to_string())]),
            scheduler_name: None,
            image_pull_secret: Some("hubsecret".to_string()),
            rollback_on_route_failure: false,
        }
    }
}

/// Model-serving deployments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServingConfig {
    pub namespace: String,
    pub image: Option<String>,
    pub replicas: u32,
    pub cpu: String,
    pub memory: String,
    pub image_pull_policy: String,
    pub model_repository: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub metrics_port: u16,
    pub external_address: String,
    pub node_selector: BTreeMap<String, String>,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            namespace: "triton-serving".to_string(),
            image: None,
            replicas: 1,
            cpu: "2".to_string(),
            memory: "8Gi".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            model_repository: "/model".to_string(),
            http_port: 8000,
            grpc_port: 8001,
            metrics_port: 8002,
            external_address: "127.0.0.1".to_string(),
            node_selector: BTreeMap::new(),
        }
    }
}

/// Distributed training jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingConfig {
    pub namespace: String,
    pub image: Option<String>,
    pub master_replicas: u32,
    pub worker_replicas: u32,
    pub cpu: String,
    pub memory: String,
    pub restart_policy: String,
    pub image_pull_policy: String,
    pub rendezvous_port: u16,
    pub node_selector: BTreeMap<String, String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            namespace: "train".to_string(),
            image: None,
            master_replicas: 1,
            worker_replicas: 1,
            cpu: "4".to_string(),
            memory: "8Gi".to_string(),
            restart_policy: "OnFailure".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            rendezvous_port: 29500,
            node_selector: BTreeMap::new(),
        }
    }
}

impl ProvisionerConfig {
    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, Report<ProvisionError>> {
        let config: Self = serde_yaml::from_str(yaml).change_context(ProvisionError::Config {
            message: "failed to parse provisioner config".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file, or return the defaults when no path is given.
    pub async fn load(path: Option<&Path>) -> Result<Self, Report<ProvisionError>> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        tracing::info!("Loading provisioner configuration from {:?}", path);

        let yaml = tokio::fs::read_to_string(path)
            .await
            .change_context_lazy(|| ProvisionError::Config {
                message: format!("failed to read config file {}", path.display()),
            })?;
        Self::from_yaml(&yaml).attach_printable_lazy(|| format!("config file: {}", path.display()))
    }

    fn validate(&self) -> Result<(), Report<ProvisionError>> {
        let ports = [
            ("session.servicePort", self.session.service_port),
            ("serving.httpPort", self.serving.http_port),
            ("serving.grpcPort", self.serving.grpc_port),
            ("serving.metricsPort", self.serving.metrics_port),
            ("training.rendezvousPort", self.training.rendezvous_port),
        ];
        if let Some((field, _)) = ports.iter().find(|(_, port)| *port == 0) {
            return Err(Report::new(ProvisionError::Config {
                message: format!("{field} must be a non-zero port"),
            }));
        }

        let namespaces = [
            ("session.namespace", &self.session.namespace),
            ("serving.namespace", &self.serving.namespace),
            ("training.namespace", &self.training.namespace),
        ];
        if let Some((field, _)) = namespaces.iter().find(|(_, ns)| ns.is_empty()) {
            return Err(Report::new(ProvisionError::Config {
                message: format!("{field} must not be empty"),
            }));
        }
        Ok(())
    }
}
