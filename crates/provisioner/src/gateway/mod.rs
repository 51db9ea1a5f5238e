//! Cluster gateway: the primitive operations the provisioning core needs from
//! the cluster API.
//!
//! The main components are:
//! - [`ClusterGateway`]: create/get/update/delete of named objects, node and pod inventory
//! - [`KubeGateway`]: implementation backed by a `kube` client
//! - [`MemoryGateway`]: in-process implementation with fault injection for tests

use core::error::Error;
use std::borrow::Cow;
use std::sync::Arc;

use api_types::NodeView;
use api_types::PodFootprint;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

pub mod kubernetes;
pub mod memory;

pub use self::kubernetes::KubeGateway;
pub use self::memory::MemoryGateway;

/// Identity of an object type on the cluster: API group, version, kind and
/// resource plural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKind {
    pub group: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub kind: Cow<'static, str>,
    pub plural: Cow<'static, str>,
}

impl ObjectKind {
    pub const POD: Self = Self::builtin("", "v1", "Pod", "pods");
    pub const SERVICE: Self = Self::builtin("", "v1", "Service", "services");
    pub const DEPLOYMENT: Self = Self::builtin("apps", "v1", "Deployment", "deployments");
    pub const VIRTUAL_SERVICE: Self = Self::builtin(
        "networking.istio.io",
        "v1beta1",
        "VirtualService",
        "virtualservices",
    );
    pub const PYTORCH_JOB: Self = Self::builtin("kubeflow.org", "v1", "PyTorchJob", "pytorchjobs");
    pub const NOTEBOOK: Self = Self::builtin("kubeflow.org", "v1", "Notebook", "notebooks");
    pub const INFERENCE_SERVICE: Self = Self::builtin(
        "serving.kserve.io",
        "v1beta1",
        "InferenceService",
        "inferenceservices",
    );
    pub const WORKFLOW: Self = Self::builtin("argoproj.io", "v1alpha1", "Workflow", "workflows");
    pub const VOLCANO_JOB: Self = Self::builtin("batch.volcano.sh", "v1alpha1", "Job", "jobs");

    const fn builtin(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        plural: &'static str,
    ) -> Self {
        Self {
            group: Cow::Borrowed(group),
            version: Cow::Borrowed(version),
            kind: Cow::Borrowed(kind),
            plural: Cow::Borrowed(plural),
        }
    }

    /// An object type not known at compile time.
    pub fn custom(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: Cow::Owned(group.into()),
            version: Cow::Owned(version.into()),
            kind: Cow::Owned(kind.into()),
            plural: Cow::Owned(plural.into()),
        }
    }

    /// Look up a well-known kind by its lowercase name or plural.
    pub fn from_short_name(name: &str) -> Option<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "pod" | "pods" => Self::POD,
            "service" | "services" | "svc" => Self::SERVICE,
            "deployment" | "deployments" => Self::DEPLOYMENT,
            "virtualservice" | "virtualservices" | "route" => Self::VIRTUAL_SERVICE,
            "pytorchjob" | "pytorchjobs" => Self::PYTORCH_JOB,
            "notebook" | "notebooks" => Self::NOTEBOOK,
            "inferenceservice" | "inferenceservices" => Self::INFERENCE_SERVICE,
            "workflow" | "workflows" => Self::WORKFLOW,
            "volcanojob" | "volcanojobs" => Self::VOLCANO_JOB,
            _ => return None,
        };
        Some(kind)
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Whether a live object of this kind can take a new spec in place.
    ///
    /// Pod specs (resources, volumes, command) are immutable once created, and
    /// training jobs do not reconcile replica spec changes, so both are replaced
    /// by delete-then-create.
    pub fn patchable_in_place(&self) -> bool {
        !(*self == Self::POD || *self == Self::PYTORCH_JOB)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Reference to an object that exists (or existed) on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Errors that can occur during cluster API operations.
#[derive(Debug, derive_more::Display)]
pub enum GatewayError {
    #[display("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[display("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: String,
        namespace: String,
        name: String,
    },
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Cluster API request failed: {message}")]
    Transport { message: String },
    #[display("Invalid object: {message}")]
    InvalidObject { message: String },
}

impl Error for GatewayError {}

impl GatewayError {
    pub fn not_found(kind: &ObjectKind, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: &ObjectKind, namespace: &str, name: &str) -> Self {
        Self::AlreadyExists {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Primitive operations against the cluster API.
///
/// Implementations must report a missing object as [`GatewayError::NotFound`]
/// so that delete paths can tolerate it while get/create paths surface it.
#[async_trait::async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Create an object from a full manifest (`apiVersion`, `kind`, `metadata`, ...).
    async fn create_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>>;

    /// Fetch the raw payload of a live object.
    async fn get_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<Value, Report<GatewayError>>;

    async fn delete_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<(), Report<GatewayError>>;

    /// Overwrite a live object's desired state with `spec`.
    async fn update_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>>;

    async fn list_nodes(&self) -> Result<Vec<NodeView>, Report<GatewayError>>;

    async fn list_pods_on_node(
        &self,
        node_name: &str,
    ) -> Result<Vec<PodFootprint>, Report<GatewayError>>;
}

#[async_trait::async_trait]
impl<T: ClusterGateway + ?Sized> ClusterGateway for Arc<T> {
    async fn create_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>> {
        self.as_ref().create_object(namespace, kind, spec).await
    }

    async fn get_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<Value, Report<GatewayError>> {
        self.as_ref().get_object(namespace, kind, name).await
    }

    async fn delete_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
    ) -> Result<(), Report<GatewayError>> {
        self.as_ref().delete_object(namespace, kind, name).await
    }

    async fn update_object(
        &self,
        namespace: &str,
        kind: &ObjectKind,
        name: &str,
        spec: &Value,
    ) -> Result<ObjectRef, Report<GatewayError>> {
        self.as_ref()
            .update_object(namespace, kind, name, spec)
            .await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeView>, Report<GatewayError>> {
        self.as_ref().list_nodes().await
    }

    async fn list_pods_on_node(
        &self,
        node_name: &str,
    ) -> Result<Vec<PodFootprint>, Report<GatewayError>> {
        self.as_ref().list_pods_on_node(node_name).await
    }
}

/// Name of an object manifest, read from `metadata.name`.
pub(crate) fn manifest_name(spec: &Value) -> Option<&str> {
    spec.pointer("/metadata/name").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn api_version_for_core_and_grouped_kinds() {
        assert_eq!(ObjectKind::POD.api_version(), "v1");
        assert_eq!(ObjectKind::DEPLOYMENT.api_version(), "apps/v1");
        assert_eq!(
            ObjectKind::VIRTUAL_SERVICE.api_version(),
            "networking.istio.io/v1beta1"
        );
    }

    #[test]
    fn custom_kind_equals_builtin_with_same_identity() {
        let custom = ObjectKind::custom("", "v1", "Pod", "pods");
        assert_eq!(custom, ObjectKind::POD);
        assert!(!custom.patchable_in_place());
    }

    #[test]
    fn patchable_kinds() {
        assert!(ObjectKind::SERVICE.patchable_in_place());
        assert!(ObjectKind::DEPLOYMENT.patchable_in_place());
        assert!(ObjectKind::VIRTUAL_SERVICE.patchable_in_place());
        assert!(!ObjectKind::POD.patchable_in_place());
        assert!(!ObjectKind::PYTORCH_JOB.patchable_in_place());
    }

    #[test]
    fn short_names() {
        assert_eq!(ObjectKind::from_short_name("svc"), Some(ObjectKind::SERVICE));
        assert_eq!(
            ObjectKind::from_short_name("Workflows"),
            Some(ObjectKind::WORKFLOW)
        );
        assert_eq!(ObjectKind::from_short_name("configmap"), None);
    }

    #[test]
    fn gateway_error_display() {
        let err = GatewayError::not_found(&ObjectKind::SERVICE, "jupyter", "alice");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Service jupyter/alice not found");

        let err = GatewayError::Transport {
            message: "connection reset".to_string(),
        };
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Cluster API request failed: connection reset");
    }
}
