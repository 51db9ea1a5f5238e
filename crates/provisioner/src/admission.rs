//! Single-node resource fit check run before any object is created.
//!
//! The check reads a fresh node/pod snapshot on every call and holds no lock,
//! so two concurrent requests can both pass against the same headroom.

use api_types::NodeView;
use api_types::ResourceQuantity;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::info;

use crate::error::ProvisionError;
use crate::gateway::ClusterGateway;

pub struct AdmissionController<G> {
    gateway: G,
}

impl<G: ClusterGateway> AdmissionController<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    /// Returns `true` as soon as one node has room for the whole request.
    ///
    /// Headroom is never summed across nodes. Listing failures are errors,
    /// never a `false` decision, and are not retried.
    #[tracing::instrument(skip_all, fields(request = %request))]
    pub async fn check(&self, request: &ResourceQuantity) -> Result<bool, Report<ProvisionError>> {
        let nodes = self
            .gateway
            .list_nodes()
            .await
            .change_context(ProvisionError::transport("failed to list nodes"))?;

        for node in &nodes {
            if self.node_fits(node, request).await? {
                info!(node = %node.name, "Request admitted");
                return Ok(true);
            }
        }

        info!(nodes = nodes.len(), "No single node has room for the request");
        Ok(false)
    }

    async fn node_fits(
        &self,
        node: &NodeView,
        request: &ResourceQuantity,
    ) -> Result<bool, Report<ProvisionError>> {
        // Capacity alone is short: no need to look at the node's pods.
        if !fits(&node.allocatable, request) {
            debug!(node = %node.name, allocatable = %node.allocatable, "Allocatable below request");
            return Ok(false);
        }

        let pods = self
            .gateway
            .list_pods_on_node(&node.name)
            .await
            .change_context_lazy(|| {
                ProvisionError::transport(format!("failed to list pods on node {}", node.name))
            })?;

        let used: ResourceQuantity = pods.iter().map(|pod| pod.requested).sum();
        let available = node.allocatable.saturating_sub(used);
        debug!(node = %node.name, %used, %available, "Computed node headroom");
        Ok(fits(&available, request))
    }
}

/// Per-dimension fit. GPUs are compared only when the request asks for some.
pub fn fits(available: &ResourceQuantity, request: &ResourceQuantity) -> bool {
    available.cpu_milli_cores >= request.cpu_milli_cores
        && available.memory_bytes >= request.memory_bytes
        && (request.gpu_units == 0 || available.gpu_units >= request.gpu_units)
}
