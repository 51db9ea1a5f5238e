//! Workload provisioning core: admission, plan building, ordered creation with
//! rollback, and status normalization against a Kubernetes cluster.

pub mod admission;
pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod kube_client;
pub mod logging;
pub mod orchestrator;
pub mod quantity;
pub mod status;

pub use engine::ProvisionOutcome;
pub use engine::Provisioner;
pub use engine::SessionUpdate;
pub use error::ProvisionError;
pub use orchestrator::ProvisionResult;
